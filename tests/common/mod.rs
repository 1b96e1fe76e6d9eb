// tests/common/mod.rs

//! Shared test utilities for integration tests.
//!
//! `FixtureServer` is a tiny HTTP/1.1 server on a std `TcpListener` that
//! serves in-memory files with `HEAD`, `ETag` and `Range: bytes=N-` support.
//! Every request is recorded so tests can assert on what the client sent.

#![allow(dead_code)]

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

/// One request as seen by the fixture
#[derive(Debug, Clone)]
pub struct Hit {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

pub struct FixtureServer {
    addr: SocketAddr,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl FixtureServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let files = Arc::new(Mutex::new(HashMap::new()));
        let hits = Arc::new(Mutex::new(Vec::new()));

        let served = Arc::clone(&files);
        let log = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let files = Arc::clone(&served);
                let hits = Arc::clone(&log);
                thread::spawn(move || handle(stream, &files, &hits));
            }
        });

        Self { addr, files, hits }
    }

    pub fn put(&self, path: &str, body: &[u8]) {
        self.files.lock().unwrap().insert(path.to_string(), body.to_vec());
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }

    pub fn gets(&self, path: &str) -> Vec<Hit> {
        self.hits()
            .into_iter()
            .filter(|h| h.method == "GET" && h.path == path)
            .collect()
    }
}

fn handle(stream: TcpStream, files: &Mutex<HashMap<String, Vec<u8>>>, hits: &Mutex<Vec<Hit>>) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("/").split('?').next().unwrap_or("/").to_string();

    let mut range = None;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).unwrap_or(0) == 0 || header.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':')
            && name.trim().eq_ignore_ascii_case("range")
        {
            range = Some(value.trim().to_string());
        }
    }

    hits.lock().unwrap().push(Hit {
        method: method.clone(),
        path: path.clone(),
        range: range.clone(),
    });

    let body = files.lock().unwrap().get(&path).cloned();
    let Some(body) = body else {
        let _ = write!(
            writer,
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        return;
    };

    let etag = format!("\"{}\"", hex_digest(&body));
    let start = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
        .filter(|start| *start < body.len());

    let (status, slice, extra) = match start {
        Some(start) => (
            "206 Partial Content",
            &body[start..],
            format!("Content-Range: bytes {}-{}/{}\r\n", start, body.len() - 1, body.len()),
        ),
        None => ("200 OK", &body[..], String::new()),
    };

    let _ = write!(
        writer,
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nETag: {etag}\r\nAccept-Ranges: bytes\r\n{extra}Connection: close\r\n\r\n",
        slice.len()
    );
    if method == "GET" {
        let _ = writer.write_all(slice);
    }
    let _ = writer.flush();
}

pub fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
