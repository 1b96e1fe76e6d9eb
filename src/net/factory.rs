// src/net/factory.rs

//! Transport selection
//!
//! | URL                                   | Transport                 |
//! |---------------------------------------|---------------------------|
//! | `bluetooth://AA-BB-CC-DD-EE-FF/path`  | [`BluetoothDownloader`]   |
//! | `file:///path`                        | [`LocalFileDownloader`]   |
//! | `tree://volume/path`                  | [`TreeDownloader`]        |
//! | `http(s)://*.onion/...` or Tor on     | [`TorDownloader`]         |
//! | any other `http(s)://`                | [`HttpDownloader`]        |
//!
//! Swap peers (literal IPv4 on the local subnet, unprivileged port) never go
//! through a proxy or Tor.

use super::bluetooth::{self as bt, BluetoothDownloader};
use super::dns::DnsCache;
use super::http::{HttpDownloader, HttpOptions, is_onion};
use super::local_file::LocalFileDownloader;
use super::tor::TorDownloader;
use super::tree::{self, DocumentTree, MountedTrees, TreeDownloader};
use super::Downloader;
use crate::bluetooth::{BluetoothConnector, RfcommConnector};
use crate::config::{Config, DownloadConfig, TorConfig, TOR_TIMEOUT_MS};
use crate::error::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Credentials and identity of the repository a URL belongs to
#[derive(Clone, PartialEq, Eq)]
pub struct RepoCredentials {
    pub repo_id: i64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for RepoCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoCredentials")
            .field("repo_id", &self.repo_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Repository metadata owned by the caller (database, config file, ...)
pub trait RepositoryLookup: Send + Sync {
    /// Repository serving `url`, if any is known
    fn lookup(&self, url: &Url) -> Option<RepoCredentials>;
}

/// IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::Configuration(format!("Invalid prefix length /{prefix}")));
        }
        let network = Ipv4Addr::from(u32::from(address) & Self::mask(prefix));
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask(self.prefix) == u32::from(self.network)
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Configuration(format!("Invalid subnet: {s}"));
        let (address, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let address: Ipv4Addr = address.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        Self::new(address, prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// True for URLs pointing at a swap peer
///
/// The port must be unprivileged, the host a literal IPv4 address, and the
/// address inside `subnet`. Without a known subnet any private address counts.
pub fn is_swap_url(url: &Url, subnet: Option<&Subnet>) -> bool {
    let Some(port) = url.port() else {
        return false;
    };
    let Some(url::Host::Ipv4(address)) = url.host() else {
        return false;
    };
    port > 1023
        && match subnet {
            Some(subnet) => subnet.contains(address),
            None => address.is_private() || address.is_link_local(),
        }
}

/// Builds the right [`Downloader`] for a URL
pub struct DownloaderFactory {
    download: DownloadConfig,
    tor: TorConfig,
    local_subnet: Option<Subnet>,
    lookup: Option<Arc<dyn RepositoryLookup>>,
    dns: Option<Arc<DnsCache>>,
    trees: Arc<dyn DocumentTree>,
    bluetooth: Arc<dyn BluetoothConnector>,
}

impl DownloaderFactory {
    pub fn new(download: DownloadConfig, tor: TorConfig) -> Result<Self> {
        let local_subnet = download.local_subnet.as_deref().map(str::parse).transpose()?;
        Ok(Self {
            download,
            tor,
            local_subnet,
            lookup: None,
            dns: None,
            trees: Arc::new(MountedTrees::new()),
            bluetooth: Arc::new(RfcommConnector::default()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.download.clone(), config.tor.clone())
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn RepositoryLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_dns(mut self, dns: Arc<DnsCache>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_trees(mut self, trees: Arc<dyn DocumentTree>) -> Self {
        self.trees = trees;
        self
    }

    pub fn with_bluetooth(mut self, connector: Arc<dyn BluetoothConnector>) -> Self {
        self.bluetooth = connector;
        self
    }

    pub fn local_subnet(&self) -> Option<&Subnet> {
        self.local_subnet.as_ref()
    }

    /// Credentials for `url` from the repository lookup
    pub fn credentials(&self, url: &Url) -> Option<RepoCredentials> {
        self.lookup.as_ref().and_then(|l| l.lookup(url))
    }

    fn http_options(&self, url: &Url, local: bool) -> HttpOptions {
        let credentials = self.credentials(url).and_then(|c| match (c.username, c.password) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        });
        let mut options = HttpOptions {
            credentials,
            local,
            dns: self.dns.clone(),
            ..HttpOptions::from_config(&self.download)
        };
        if local {
            options.proxy = None;
        } else if is_onion(url) {
            options.timeout = Duration::from_millis(TOR_TIMEOUT_MS.max(self.tor.timeout_ms));
        }
        options
    }

    /// Pick and construct the transport for `url`, writing to `output`
    pub fn create(&self, url: &Url, output: &Path) -> Result<Box<dyn Downloader>> {
        match url.scheme() {
            bt::SCHEME => {
                debug!("Using Bluetooth transport for {}", url);
                Ok(Box::new(BluetoothDownloader::new(url, output, Arc::clone(&self.bluetooth))?))
            }
            "file" => Ok(Box::new(LocalFileDownloader::new(url, output)?)),
            tree::SCHEME => Ok(Box::new(TreeDownloader::new(url, output, Arc::clone(&self.trees))?)),
            "http" | "https" => {
                let local = is_swap_url(url, self.local_subnet.as_ref());
                let options = self.http_options(url, local);
                if !local && (is_onion(url) || self.tor.enabled) {
                    debug!("Using Tor transport for {}", url);
                    Ok(Box::new(TorDownloader::new(url, output, options, &self.tor)?))
                } else {
                    Ok(Box::new(HttpDownloader::new(url, output, options)?))
                }
            }
            other => Err(Error::Configuration(format!("Unsupported URL scheme: {other}"))),
        }
    }
}
