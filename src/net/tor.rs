// src/net/tor.rs

//! HTTP routed through a local Tor SOCKS proxy
//!
//! Same protocol behaviour as [`HttpDownloader`]; only the client differs:
//! every request goes through `socks5h://` (names resolve inside Tor, never
//! locally) with timeouts long enough for circuit setup.

use super::http::{HttpDownloader, HttpOptions};
use super::{ByteStream, Closer, DownloadSession, Downloader};
use crate::config::TorConfig;
use crate::error::{Error, Result};
use crate::progress::ProgressListener;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub struct TorDownloader {
    inner: HttpDownloader,
}

impl TorDownloader {
    pub fn new(url: &Url, output: &Path, options: HttpOptions, tor: &TorConfig) -> Result<Self> {
        if !tor.socks_proxy.starts_with("socks5h://") && !tor.socks_proxy.starts_with("socks5://") {
            return Err(Error::Configuration(format!(
                "Tor proxy must be a SOCKS5 URL, got {}",
                tor.socks_proxy
            )));
        }
        debug!("Routing {} through Tor at {}", url, tor.socks_proxy);

        let options = HttpOptions {
            proxy: Some(tor.socks_proxy.clone()),
            timeout: options.timeout.max(Duration::from_millis(tor.timeout_ms)),
            local: false,
            // Cached clearnet addresses must not leak into Tor requests
            dns: None,
            ..options
        };
        Ok(Self {
            inner: HttpDownloader::new(url, output, options)?,
        })
    }

    pub fn url(&self) -> &Url {
        self.inner.url()
    }
}

impl Downloader for TorDownloader {
    fn session(&self) -> &DownloadSession {
        self.inner.session()
    }

    fn session_mut(&mut self) -> &mut DownloadSession {
        self.inner.session_mut()
    }

    fn closer(&self) -> &Closer {
        self.inner.closer()
    }

    fn open(&mut self, offset: u64) -> Result<ByteStream> {
        self.inner.open(offset)
    }

    fn total_size(&mut self) -> Result<Option<u64>> {
        self.inner.total_size()
    }

    fn has_changed(&self) -> bool {
        self.inner.has_changed()
    }

    fn download(&mut self, listener: &dyn ProgressListener) -> Result<()> {
        self.inner.download(listener)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tor_uses_high_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse("http://example.onion/repo/index-v1.jar").unwrap();
        let downloader = TorDownloader::new(
            &url,
            &dir.path().join("index"),
            HttpOptions::default(),
            &TorConfig::default(),
        )
        .unwrap();

        assert_eq!(downloader.session().timeout(), Duration::from_secs(300));
        assert_eq!(downloader.url().host_str(), Some("example.onion"));
    }

    #[test]
    fn test_rejects_http_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse("http://example.onion/x").unwrap();
        let tor = TorConfig {
            socks_proxy: "http://127.0.0.1:8118".into(),
            ..TorConfig::default()
        };
        let err = TorDownloader::new(&url, &dir.path().join("x"), HttpOptions::default(), &tor)
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
