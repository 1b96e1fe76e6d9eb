// src/bluetooth/protocol.rs

//! The "httpish" protocol spoken over RFCOMM
//!
//! A stripped-down HTTP/1.0 without versions or reason phrases:
//!
//! ```text
//! GET fdroid/repo/index-v1.jar        HEAD fdroid/repo/app.apk
//! <header>: <value>                   (optional)
//!                                     (blank line)
//!
//! 200                                 404
//! Content-Length: 5123                Content-Length: 0
//! ETag: "ab12"
//!
//! <exactly Content-Length bytes>
//! ```
//!
//! Several requests can share one connection; `HEAD` responses carry the
//! size in `Content-Length` but no body.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, Read, Write};

/// Longest accepted request, status or header line
const MAX_LINE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header names are stored lower-cased
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Path relative to the web root, without a leading slash
    pub path: String,
    pub headers: Headers,
}

impl Request {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.trim_start_matches('/').to_string(),
            headers: Headers::new(),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "{} {}", self.method, self.path)?;
        write_headers(writer, &self.headers)?;
        writer.flush()
    }

    /// Block until a complete request arrives
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let line = read_line(reader)?
            .ok_or_else(|| Error::ConnectionFailed("Peer closed the connection".into()))?;
        let (method, path) = line
            .split_once(' ')
            .ok_or_else(|| Error::Protocol(format!("Malformed request line: {line}")))?;
        let method = match method {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            other => return Err(Error::Protocol(format!("Unsupported method: {other}"))),
        };

        Ok(Self {
            method,
            path: path.trim().trim_start_matches('/').to_string(),
            headers: read_headers(reader)?,
        })
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag").map(String::as_str)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "{}", self.status)?;
        write_headers(writer, &self.headers)
    }

    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let line = read_line(reader)?
            .ok_or_else(|| Error::ConnectionFailed("Peer closed before responding".into()))?;
        let status = line
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::Protocol(format!("Malformed status line: {line}")))?;
        Ok(Self {
            status,
            headers: read_headers(reader)?,
        })
    }
}

/// Write a full response; `body` must yield exactly `Content-Length` bytes
pub fn write_response<W: Write>(
    writer: &mut W,
    head: &ResponseHead,
    body: Option<&mut dyn Read>,
) -> io::Result<()> {
    head.write_to(writer)?;
    if let Some(body) = body {
        let expected = head.content_length().unwrap_or(0);
        let copied = io::copy(&mut body.take(expected), writer)?;
        if copied != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended after {copied} of {expected} bytes"),
            ));
        }
    }
    writer.flush()
}

fn write_headers<W: Write>(writer: &mut W, headers: &Headers) -> io::Result<()> {
    for (name, value) in headers {
        writeln!(writer, "{}: {}", name, value)?;
    }
    writer.write_all(b"\n")
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<Headers> {
    let mut headers = Headers::new();
    loop {
        let line = read_line(reader)?
            .ok_or_else(|| Error::ConnectionFailed("Connection closed inside headers".into()))?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("Malformed header: {line}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
}

/// One `\n`-terminated line without its terminator, `None` at a clean EOF
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let read = reader
        .take(MAX_LINE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .map_err(|e| Error::from_io("bluetooth", e))?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE {
            return Err(Error::Protocol("Line too long".into()));
        }
        return Err(Error::ConnectionFailed("Connection closed mid-line".into()));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| Error::Protocol("Line is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn test_request_wire_format() {
        let mut request = Request::new(Method::Get, "/fdroid/repo/index-v1.jar");
        request.headers.insert("range".into(), "bytes=10-".into());

        let mut wire = Vec::new();
        request.write_to(&mut wire).unwrap();
        assert_eq!(
            String::from_utf8(wire.clone()).unwrap(),
            "GET fdroid/repo/index-v1.jar\nrange: bytes=10-\n\n"
        );

        let parsed = Request::read_from(&mut BufReader::new(Cursor::new(wire))).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_response_with_body() {
        let head = ResponseHead::new(200)
            .with_header("Content-Length", "5")
            .with_header("ETag", "\"x\"");
        let mut body = Cursor::new(b"hello".to_vec());
        let mut wire = Vec::new();
        write_response(&mut wire, &head, Some(&mut body)).unwrap();

        let mut reader = BufReader::new(Cursor::new(wire));
        let parsed = ResponseHead::read_from(&mut reader).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.content_length(), Some(5));
        assert_eq!(parsed.etag(), Some("\"x\""));

        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "hello");
    }

    #[test]
    fn test_short_body_is_error() {
        let head = ResponseHead::new(200).with_header("Content-Length", "10");
        let mut body = Cursor::new(b"abc".to_vec());
        let err = write_response(&mut Vec::new(), &head, Some(&mut body)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_malformed_input() {
        let mut reader = BufReader::new(Cursor::new(b"PUT x\n\n".to_vec()));
        assert!(matches!(Request::read_from(&mut reader), Err(Error::Protocol(_))));

        let mut reader = BufReader::new(Cursor::new(b"OK\n\n".to_vec()));
        assert!(matches!(ResponseHead::read_from(&mut reader), Err(Error::Protocol(_))));

        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert_eq!(
            Request::read_from(&mut reader).unwrap_err().kind(),
            crate::ErrorKind::ConnectionFailed
        );
    }
}
