// src/swap/webroot.rs

//! Sandboxed static file responder
//!
//! Shared by the HTTP server and the Bluetooth server, so it knows nothing
//! about either: it takes a path plus the few request headers that matter
//! and produces a status, headers and a body.
//!
//! Rules:
//! - anything after `?` is ignored
//! - a path containing `../` is refused with 403
//! - directories without a trailing `/` redirect (301) to the slash form
//! - directories serve `index.html`, otherwise an HTML listing
//! - files honour `Range: bytes=a-b`, `If-Range` and `If-None-Match` against a
//!   weak validator built from path, mtime and length

use crate::error::{Error, Result};
use crate::hash::xxh128;
use crate::net::tree::percent_decode;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

pub const INDEX_FILE_NAMES: &[&str] = &["index.html"];

pub const MIME_PLAINTEXT: &str = "text/plain";
pub const MIME_HTML: &str = "text/html";
const MIME_DEFAULT: &str = "application/octet-stream";

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; img-src 'self'; style-src 'self' 'unsafe-inline';";

/// Only types a browser should be offered when browsing the swap repo
pub fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("apk") => "application/vnd.android.package-archive",
        Some("html") => MIME_HTML,
        Some("png") => "image/png",
        Some("xml") => "application/xml",
        Some("json") => "application/json",
        _ => MIME_DEFAULT,
    }
}

/// The parts of a request the responder looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebRequest {
    pub path: String,
    pub range: Option<String>,
    pub if_range: Option<String>,
    pub if_none_match: Option<String>,
}

impl WebRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn with_if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    pub fn with_if_range(mut self, etag: impl Into<String>) -> Self {
        self.if_range = Some(etag.into());
        self
    }
}

pub enum WebBody {
    Empty,
    Text(String),
    /// Open file positioned at the first byte to send
    File { file: File, len: u64 },
}

impl WebBody {
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Text(text) => text.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocking reader over the body
    pub fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            Self::Empty => Box::new(std::io::empty()),
            Self::Text(text) => Box::new(std::io::Cursor::new(text.into_bytes())),
            Self::File { file, len } => Box::new(file.take(len)),
        }
    }
}

impl std::fmt::Debug for WebBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::File { len, .. } => f.debug_struct("File").field("len", len).finish(),
        }
    }
}

#[derive(Debug)]
pub struct WebResponse {
    pub status: u16,
    /// Lowercase names, in insertion order
    pub headers: Vec<(String, String)>,
    pub body: WebBody,
}

impl WebResponse {
    pub fn new(status: u16, content_type: &str, body: WebBody) -> Self {
        let mut response = Self {
            status,
            headers: Vec::new(),
            body,
        };
        response.set_header("content-type", content_type);
        response.set_header("connection", "close");
        response.set_header("content-security-policy", CONTENT_SECURITY_POLICY);
        response
    }

    pub fn text(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, MIME_PLAINTEXT, WebBody::Text(message.into()))
    }

    pub fn forbidden(reason: &str) -> Self {
        Self::text(403, format!("FORBIDDEN: {reason}"))
    }

    pub fn not_found() -> Self {
        Self::text(404, "Error 404, file not found.")
    }

    pub fn internal_error(reason: &str) -> Self {
        Self::text(500, format!("INTERNAL ERROR: {reason}"))
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Bytes the body will produce
    pub fn content_length(&self) -> u64 {
        self.body.len()
    }

    /// Read a text or file body into memory
    pub fn into_bytes(self) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.body.into_reader().read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Files under one directory, nothing outside it
#[derive(Debug, Clone)]
pub struct WebRoot {
    root: PathBuf,
}

impl WebRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn respond(&self, request: &WebRequest) -> WebResponse {
        if !self.root.is_dir() {
            return WebResponse::internal_error(&format!(
                "given path is not a directory ({}).",
                self.root.display()
            ));
        }

        let mut uri = request.path.trim().replace('\\', "/");
        if let Some(query) = uri.find('?') {
            uri.truncate(query);
        }
        let uri = percent_decode(&uri).replace('\\', "/");
        if uri.contains("../") || uri.ends_with("/..") || uri == ".." {
            debug!("[swap] Refusing traversal in {}", uri);
            return WebResponse::forbidden("Won't serve ../ for security reasons.");
        }
        let uri = if uri.starts_with('/') { uri } else { format!("/{uri}") };

        let target = self.root.join(uri.trim_start_matches('/'));
        if !target.exists() {
            return WebResponse::not_found();
        }

        if target.is_dir() {
            if !uri.ends_with('/') {
                let location = format!("{uri}/");
                let mut response = WebResponse::new(
                    301,
                    MIME_HTML,
                    WebBody::Text(format!(
                        "<html><body>Redirected: <a href=\"{location}\">{location}</a></body></html>"
                    )),
                );
                response.set_header("location", location);
                return response;
            }

            if let Some(index) = INDEX_FILE_NAMES
                .iter()
                .find(|name| target.join(name).is_file())
            {
                let index_request = WebRequest {
                    path: format!("{uri}{index}"),
                    ..request.clone()
                };
                return self.respond(&index_request);
            }

            return match list_directory(&uri, &target) {
                Ok(html) => WebResponse::new(200, MIME_HTML, WebBody::Text(html)),
                Err(e) => {
                    warn!("[swap] Cannot list {}: {}", target.display(), e);
                    WebResponse::forbidden("No directory listing.")
                }
            };
        }

        match serve_file(request, &target) {
            Ok(response) => response,
            Err(e) => {
                warn!("[swap] Reading {} failed: {}", target.display(), e);
                WebResponse::forbidden("Reading file failed.")
            }
        }
    }
}

/// Quoted validator over absolute path, mtime (ms) and length
pub fn etag_for(path: &Path) -> Result<String> {
    let meta = fs::metadata(path).map_err(|e| Error::from_io(&path.display().to_string(), e))?;
    let absolute = std::path::absolute(path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seed = format!("{}{}{}", absolute.display(), mtime, meta.len());
    Ok(format!("\"{}\"", xxh128(seed.as_bytes())))
}

/// `bytes=a-b`; an open or unparsable end means "to the end of the file"
fn parse_range(range: &str) -> Option<(u64, Option<u64>)> {
    let spec = range.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    if start.is_empty() {
        return Some((0, None));
    }
    let start = start.trim().parse().ok()?;
    Some((start, end.trim().parse().ok()))
}

fn etag_matches(header: &str, etag: &str) -> bool {
    let header = header.trim();
    header == "*" || header == etag || header.trim_matches('"') == etag.trim_matches('"')
}

fn serve_file(request: &WebRequest, path: &Path) -> Result<WebResponse> {
    let mime = mime_type(path);
    let etag = etag_for(path)?;
    let len = fs::metadata(path)?.len();

    let if_range_ok = request
        .if_range
        .as_deref()
        .is_none_or(|value| etag_matches(value, &etag));
    let not_modified = request
        .if_none_match
        .as_deref()
        .is_some_and(|value| etag_matches(value, &etag));
    let range = request.range.as_deref().and_then(parse_range);

    let mut response = match range {
        Some((start, end)) if if_range_ok && start < len && end.is_none_or(|end| end >= start) => {
            if not_modified {
                WebResponse::new(304, mime, WebBody::Empty)
            } else {
                let end = end.unwrap_or(len - 1).min(len - 1);
                let count = (end + 1).saturating_sub(start);
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(start))?;
                let mut response =
                    WebResponse::new(206, mime, WebBody::File { file, len: count });
                response.set_header("content-length", count.to_string());
                response.set_header("content-range", format!("bytes {start}-{end}/{len}"));
                response
            }
        }
        Some(_) if if_range_ok => {
            // Past the end or inverted; 4xx is not overridden by If-None-Match
            let mut response = WebResponse::new(416, MIME_PLAINTEXT, WebBody::Empty);
            response.set_header("content-range", format!("bytes */{len}"));
            response
        }
        _ if not_modified => WebResponse::new(304, mime, WebBody::Empty),
        _ => {
            let file = File::open(path)?;
            let mut response = WebResponse::new(200, mime, WebBody::File { file, len });
            response.set_header("content-length", len.to_string());
            response
        }
    };

    response.set_header("accept-ranges", "bytes");
    response.set_header("etag", etag);
    Ok(response)
}

fn human_size(len: u64) -> String {
    if len < 1024 {
        format!("{len} bytes")
    } else if len < 1024 * 1024 {
        format!("{}.{} KB", len / 1024, len % 1024 / 10 % 100)
    } else {
        format!("{}.{} MB", len / (1024 * 1024), len % (1024 * 1024) / 10000 % 100)
    }
}

fn encode_uri(uri: &str) -> String {
    let mut out = String::with_capacity(uri.len());
    for byte in uri.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn list_directory(uri: &str, dir: &Path) -> std::io::Result<String> {
    let heading = format!("Directory {uri}");
    let mut html = format!(
        "<html><head><title>{heading}</title><style><!--\n\
         span.dirname {{ font-weight: bold; }}\n\
         span.filesize {{ font-size: 75%; }}\n\
         // -->\n</style></head><body><h1>{heading}</h1>"
    );

    let up = (uri.len() > 1)
        .then(|| &uri[..uri.len() - 1])
        .and_then(|u| u.rfind('/'))
        .map(|slash| &uri[..=slash]);

    let mut directories = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            directories.push(name);
        } else if meta.is_file() {
            files.push((name, meta.len()));
        }
    }
    directories.sort();
    files.sort();

    if up.is_some() || !directories.is_empty() || !files.is_empty() {
        html.push_str("<ul>");
        if up.is_some() || !directories.is_empty() {
            html.push_str("<section class=\"directories\">");
            if let Some(up) = up {
                html.push_str(&format!(
                    "<li><a rel=\"directory\" href=\"{up}\"><span class=\"dirname\">..</span></a></li>"
                ));
            }
            for directory in &directories {
                html.push_str(&format!(
                    "<li><a rel=\"directory\" href=\"{}\"><span class=\"dirname\">{directory}/</span></a></li>",
                    encode_uri(&format!("{uri}{directory}/"))
                ));
            }
            html.push_str("</section>");
        }
        if !files.is_empty() {
            html.push_str("<section class=\"files\">");
            for (file, len) in &files {
                html.push_str(&format!(
                    "<li><a href=\"{}\"><span class=\"filename\">{file}</span></a>&nbsp;<span class=\"filesize\">({})</span></li>",
                    encode_uri(&format!("{uri}{file}")),
                    human_size(*len)
                ));
            }
            html.push_str("</section>");
        }
        html.push_str("</ul>");
    }
    html.push_str("</body></html>");
    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, WebRoot) {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("fdroid/repo");
        fs::create_dir_all(repo.join("icons")).unwrap();
        fs::write(repo.join("app.apk"), (0..100u8).collect::<Vec<_>>()).unwrap();
        fs::write(repo.join("big.apk"), vec![0u8; 2048]).unwrap();
        fs::write(dir.path().join("secret.txt"), b"top secret").unwrap();
        let root = WebRoot::new(dir.path().join("fdroid"));
        (dir, root)
    }

    fn body(response: WebResponse) -> String {
        String::from_utf8(response.into_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_traversal_forbidden() {
        let (_dir, root) = fixture();
        for path in ["/../secret.txt", "/repo/../../secret.txt", "/repo/%2E%2E/%2e%2e/secret.txt"] {
            let response = root.respond(&WebRequest::get(path));
            assert_eq!(response.status, 403, "{path}");
            assert!(body(response).starts_with("FORBIDDEN"));
        }
    }

    #[test]
    fn test_not_found_and_query() {
        let (_dir, root) = fixture();
        let response = root.respond(&WebRequest::get("/repo/missing.apk"));
        assert_eq!(response.status, 404);
        assert_eq!(body(response), "Error 404, file not found.");

        let response = root.respond(&WebRequest::get("/repo/app.apk?client_version=1"));
        assert_eq!(response.status, 200);
        assert_eq!(response.content_length(), 100);
        assert_eq!(response.header("content-type"), Some("application/vnd.android.package-archive"));
        assert_eq!(response.header("accept-ranges"), Some("bytes"));
    }

    #[test]
    fn test_directory_redirect_and_listing() {
        let (_dir, root) = fixture();
        let response = root.respond(&WebRequest::get("/repo"));
        assert_eq!(response.status, 301);
        assert_eq!(response.header("location"), Some("/repo/"));

        let html = body(root.respond(&WebRequest::get("/repo/")));
        assert!(html.contains("<h1>Directory /repo/</h1>"));
        assert!(html.contains("href=\"/\""));
        assert!(html.contains("href=\"/repo/icons/\""));
        assert!(html.contains("(100 bytes)"));
        assert!(html.contains("(2.0 KB)"));
        assert!(html.find("icons/").unwrap() < html.find("app.apk").unwrap());
    }

    #[test]
    fn test_index_file_served_for_directory() {
        let (dir, root) = fixture();
        fs::write(dir.path().join("fdroid/index.html"), "<p>swap</p>").unwrap();
        let response = root.respond(&WebRequest::get("/"));
        assert_eq!(response.status, 200);
        assert_eq!(body(response), "<p>swap</p>");
    }

    #[test]
    fn test_range_requests() {
        let (_dir, root) = fixture();
        let response = root.respond(&WebRequest::get("/repo/app.apk").with_range("bytes=10-19"));
        assert_eq!(response.status, 206);
        assert_eq!(response.header("content-range"), Some("bytes 10-19/100"));
        assert_eq!(response.header("content-length"), Some("10"));
        assert_eq!(response.into_bytes().unwrap(), (10..20u8).collect::<Vec<_>>());

        let response = root.respond(&WebRequest::get("/repo/app.apk").with_range("bytes=90-"));
        assert_eq!(response.status, 206);
        assert_eq!(response.header("content-range"), Some("bytes 90-99/100"));

        let response = root.respond(&WebRequest::get("/repo/app.apk").with_range("bytes=100-200"));
        assert_eq!(response.status, 416);
        assert_eq!(response.header("content-range"), Some("bytes */100"));

        let response = root.respond(&WebRequest::get("/repo/app.apk").with_range("bytes=20-10"));
        assert_eq!(response.status, 416);
        assert_eq!(response.header("content-range"), Some("bytes */100"));

        let response = root.respond(
            &WebRequest::get("/repo/app.apk")
                .with_range("bytes=10-19")
                .with_if_range("\"stale\""),
        );
        assert_eq!(response.status, 200);
        assert_eq!(response.content_length(), 100);
    }

    #[test]
    fn test_etag_conditional() {
        let (dir, root) = fixture();
        let first = root.respond(&WebRequest::get("/repo/app.apk"));
        let etag = first.header("etag").unwrap().to_string();
        assert!(etag.starts_with('"') && etag.ends_with('"'));

        let response = root.respond(&WebRequest::get("/repo/app.apk").with_if_none_match(&etag));
        assert_eq!(response.status, 304);
        assert!(response.body.is_empty());

        let apk = dir.path().join("fdroid/repo/app.apk");
        filetime::set_file_mtime(&apk, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let response = root.respond(&WebRequest::get("/repo/app.apk").with_if_none_match(&etag));
        assert_eq!(response.status, 200);
        assert_ne!(response.header("etag").unwrap(), etag);
    }

    #[test]
    fn test_missing_root_is_internal_error() {
        let root = WebRoot::new("/nonexistent/fdroid-net-root");
        assert_eq!(root.respond(&WebRequest::get("/")).status, 500);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(1023), "1023 bytes");
        assert_eq!(human_size(1536), "1.51 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }
}
