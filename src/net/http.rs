// src/net/http.rs

//! HTTP(S) transport
//!
//! A `HEAD` round-trip decides whether anything needs to be fetched at all:
//! the server's `ETag` (or, failing that, a tag computed from
//! `Last-Modified` and `Content-Length`) is compared with the tag the caller
//! remembered from the previous download. The `ETag` is never sent back to
//! the server, so it cannot double as a tracking cookie.
//!
//! When a transfer is needed, a partial file of the right size class is
//! resumed with `Range: bytes=<len>-`. A server that ignores the range gets
//! one fresh attempt from zero.

use super::dns::DnsCache;
use super::{ByteStream, Closer, DownloadSession, Downloader, download_from_stream};
use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::progress::ProgressListener;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderName, LAST_MODIFIED, RANGE};
use reqwest::{Method, StatusCode};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Client settings resolved by the factory for one URL
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Connect and per-read timeout
    pub timeout: Duration,
    pub user_agent: String,
    pub proxy: Option<String>,
    /// `key=value&...` appended to every request
    pub query_string: Option<String>,
    /// HTTP Basic username and password
    pub credentials: Option<(String, String)>,
    /// Swap peer on the local network: no proxy, self-signed certificates accepted
    pub local: bool,
    pub dns: Option<Arc<DnsCache>>,
}

impl HttpOptions {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            timeout: config.timeout(),
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
            query_string: config.query_string.clone(),
            credentials: None,
            local: false,
            dns: None,
        }
    }
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

/// True for Tor onion service hosts
pub fn is_onion(url: &Url) -> bool {
    url.host_str().is_some_and(|h| h.ends_with(".onion"))
}

/// Result of the metadata round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    /// False when the server's ETag equals the tag we asked about
    pub etag_changed: bool,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
}

impl HeadInfo {
    /// Mirror-independent fallback tag: `<last-modified secs hex>-<length hex>`
    ///
    /// Mirrors running different web servers publish different ETags for the
    /// same bytes, while modification time and length usually survive rsync.
    pub fn calculated_etag(&self) -> String {
        let modified = self
            .last_modified
            .as_deref()
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.timestamp().max(0))
            .unwrap_or(0);
        let length = self.content_length.map(|l| l as i64).unwrap_or(-1);
        format!("{modified:x}-{length:x}")
    }
}

/// Downloads one URL over HTTP(S)
pub struct HttpDownloader {
    session: DownloadSession,
    closer: Closer,
    client: Client,
    url: Url,
    credentials: Option<(String, String)>,
    dns: Option<Arc<DnsCache>>,
    changed: bool,
    file_size: Option<u64>,
}

impl HttpDownloader {
    pub fn new(url: &Url, output: &Path, options: HttpOptions) -> Result<Self> {
        let mut url = url.clone();
        if let Some(query) = options.query_string.as_deref().filter(|q| !q.is_empty()) {
            let extra: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect();
            url.query_pairs_mut().extend_pairs(extra);
        }

        let client = build_client(&options, url.host_str())?;
        let mut session = DownloadSession::new(url.as_str(), output);
        session.set_timeout(options.timeout);

        Ok(Self {
            session,
            closer: Closer::new(),
            client,
            url,
            credentials: options.credentials,
            dns: options.dns,
            changed: false,
            file_size: None,
        })
    }

    /// Size known before the transfer, e.g. from the repository index
    pub fn with_expected_size(mut self, size: Option<u64>) -> Self {
        self.file_size = size;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request(&self, method: Method) -> RequestBuilder {
        let request = self.client.request(method, self.url.clone());
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    fn remember_peer(&self, response: &Response) {
        if let (Some(dns), Some(host), Some(addr)) =
            (&self.dns, self.url.host_str(), response.remote_addr())
        {
            dns.insert(host, vec![addr.ip()]);
        }
    }

    /// Ask for size and validators without fetching the body
    ///
    /// `NotFound` for 404; other unsuccessful statuses yield `None`.
    pub fn head(&mut self, etag: Option<&str>) -> Result<Option<HeadInfo>> {
        debug!("HEAD {}", self.url);
        let response = self.request(Method::HEAD).send()?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(self.url.to_string()));
        }
        if !status.is_success() {
            warn!("Error getting HEAD: {}", status);
            return Ok(None);
        }
        self.remember_peer(&response);

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let server_etag = header(ETAG);
        let content_length = header(CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok());

        Ok(Some(HeadInfo {
            etag_changed: !(etag.is_some() && server_etag.as_deref() == etag),
            etag: server_etag,
            content_length,
            last_modified: header(LAST_MODIFIED),
        }))
    }

    fn download_to_file(&mut self, listener: &dyn ProgressListener) -> Result<()> {
        let output = self.output_file().to_path_buf();
        let file_length = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);

        let resumable = match self.file_size {
            Some(size) if file_length == size && output.is_file() => {
                debug!("Already have {}, not downloading", output.display());
                return Ok(());
            }
            Some(size) if file_length < size => file_length > 0,
            _ => {
                remove_partial(&output);
                false
            }
        };

        debug!("Downloading {} (is resumable: {})", self.url, resumable);
        match download_from_stream(self, resumable, listener) {
            Err(Error::NoResume(reason)) => {
                debug!("Resume refused ({}), restarting from zero", reason);
                remove_partial(&output);
                download_from_stream(self, false, listener)
            }
            other => other,
        }
    }
}

fn remove_partial(path: &Path) {
    if path.exists()
        && let Err(e) = fs::remove_file(path)
    {
        warn!("Warning: {} not deleted: {}", path.display(), e);
    }
}

fn build_client(options: &HttpOptions, host: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(options.user_agent.clone())
        .connect_timeout(options.timeout)
        .timeout(options.timeout)
        .redirect(reqwest::redirect::Policy::none());

    if options.local {
        debug!("Local swap peer, bypassing proxy and certificate checks");
        builder = builder.no_proxy().danger_accept_invalid_certs(true);
    } else if let Some(proxy) = &options.proxy {
        let proxy = reqwest::Proxy::all(proxy.as_str())
            .map_err(|e| Error::Configuration(format!("Invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }

    if let (Some(dns), Some(host)) = (&options.dns, host)
        && let Some(addrs) = dns.lookup(host)
    {
        debug!("Using cached addresses for {}: {:?}", host, addrs);
        builder = builder.resolve_to_addrs(host, &addrs);
    }

    builder
        .build()
        .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))
}

impl Downloader for HttpDownloader {
    fn session(&self) -> &DownloadSession {
        &self.session
    }

    fn session_mut(&mut self) -> &mut DownloadSession {
        &mut self.session
    }

    fn closer(&self) -> &Closer {
        &self.closer
    }

    fn open(&mut self, offset: u64) -> Result<ByteStream> {
        let mut request = self.request(Method::GET);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        debug!("GET {}", self.url);
        let response = request.send()?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(self.url.to_string()));
        }
        if !status.is_success() {
            return Err(Error::Protocol(format!("HTTP {} from {}", status, self.url)));
        }
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::NoResume(format!("HTTP {} from {}", status, self.url)));
        }
        self.remember_peer(&response);

        if offset == 0 && self.file_size.is_none() {
            self.file_size = response.content_length();
        }
        if let Some(tag) = response.headers().get(ETAG).and_then(|v| v.to_str().ok()) {
            self.session.set_cache_tag(Some(tag.to_string()));
        }

        Ok(ByteStream::new(response, self.closer.clone()))
    }

    fn total_size(&mut self) -> Result<Option<u64>> {
        Ok(self.file_size)
    }

    fn has_changed(&self) -> bool {
        self.changed
    }

    fn download(&mut self, listener: &dyn ProgressListener) -> Result<()> {
        let expected_tag = self.session.cache_tag().map(str::to_string);

        if let Some(head) = self.head(expected_tag.as_deref())? {
            let calculated = head.calculated_etag();
            if head.content_length.is_some() {
                self.file_size = head.content_length;
            }
            self.session
                .set_cache_tag(Some(head.etag.clone().unwrap_or_else(|| calculated.clone())));

            if !head.etag_changed || expected_tag.as_deref() == Some(calculated.as_str()) {
                debug!("{} cached, not downloading", self.url);
                self.changed = false;
                return Ok(());
            }
        }

        self.changed = true;
        self.download_to_file(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(etag: Option<&str>, len: Option<u64>, modified: Option<&str>) -> HeadInfo {
        HeadInfo {
            etag_changed: true,
            etag: etag.map(str::to_string),
            content_length: len,
            last_modified: modified.map(str::to_string),
        }
    }

    #[test]
    fn test_calculated_etag() {
        let info = head(None, Some(1000), Some("Thu, 01 Jan 1970 00:01:00 GMT"));
        assert_eq!(info.calculated_etag(), "3c-3e8");

        let unknown = head(None, None, Some("not a date"));
        assert_eq!(unknown.calculated_etag(), "0-ffffffffffffffff");
    }

    #[test]
    fn test_is_onion() {
        let onion = Url::parse("http://fdroidorg6cooksyluodepej4erfctzk7rrjpjbbr6wx24jh3lqyfwyd.onion/repo").unwrap();
        assert!(is_onion(&onion));
        assert!(!is_onion(&Url::parse("https://f-droid.org/repo").unwrap()));
    }

    #[test]
    fn test_query_string_appended() {
        let dir = tempfile::tempdir().unwrap();
        let options = HttpOptions {
            query_string: Some("client_version=1&lang=de".into()),
            ..HttpOptions::default()
        };
        let url = Url::parse("https://example.org/repo/index-v1.jar").unwrap();
        let downloader = HttpDownloader::new(&url, &dir.path().join("index"), options).unwrap();

        assert_eq!(
            downloader.url().as_str(),
            "https://example.org/repo/index-v1.jar?client_version=1&lang=de"
        );
        assert_eq!(downloader.source(), downloader.url().as_str());
    }

    #[test]
    fn test_invalid_proxy_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = HttpOptions {
            proxy: Some("::not a proxy::".into()),
            ..HttpOptions::default()
        };
        let url = Url::parse("https://example.org/a.apk").unwrap();
        let err = HttpDownloader::new(&url, &dir.path().join("a.apk"), options)
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
