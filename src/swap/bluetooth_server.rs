// src/swap/bluetooth_server.rs
//! Swap server over Bluetooth RFCOMM
//!
//! Each accepted client gets its own thread, which answers httpish requests
//! from the same [`WebRoot`] the HTTP server uses until the peer hangs up.

use super::webroot::{WebRequest, WebResponse, WebRoot};
use crate::bluetooth::protocol::{Method, Request, ResponseHead, write_response};
use crate::bluetooth::{BluetoothConnection, Duplex, RfcommListener};
use crate::error::{Error, Result};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, error, info, warn};

/// Headers copied from the web-root response onto the httpish response
const FORWARDED_HEADERS: &[&str] = &[
    "content-type",
    "etag",
    "accept-ranges",
    "content-range",
    "location",
];

pub struct BluetoothServer {
    channel: u8,
    listener: Arc<RfcommListener>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl BluetoothServer {
    /// Listen on `channel` and serve `web_root` until stopped
    pub fn start(channel: u8, web_root: WebRoot) -> Result<Self> {
        let listener = RfcommListener::bind(channel)
            .map_err(|e| Error::InitError(format!("Cannot listen on RFCOMM channel {channel}: {e}")))?;
        let listener = Arc::new(listener);
        let running = Arc::new(AtomicBool::new(true));

        let accept_listener = Arc::clone(&listener);
        let accept_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("bluetooth-accept".into())
            .spawn(move || accept_loop(&accept_listener, &accept_running, &web_root))
            .map_err(|e| Error::InitError(format!("Cannot spawn Bluetooth accept thread: {e}")))?;

        info!("[bluetooth] Serving swap repo on RFCOMM channel {}", channel);
        Ok(Self {
            channel,
            listener,
            running,
            thread: Some(handle),
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.listener.shutdown();
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            error!("[bluetooth] Accept thread panicked");
        }
    }
}

impl Drop for BluetoothServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &RfcommListener, running: &AtomicBool, web_root: &WebRoot) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(stream) => {
                let web_root = web_root.clone();
                let spawned = thread::Builder::new()
                    .name("bluetooth-client".into())
                    .spawn(move || {
                        if let Err(e) = serve_client(stream, &web_root) {
                            debug!("[bluetooth] Client session ended: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("[bluetooth] Cannot spawn client thread: {}", e);
                }
            }
            Err(e) if !running.load(Ordering::SeqCst) => {
                debug!("[bluetooth] Accept interrupted by shutdown: {}", e);
            }
            Err(e) => {
                error!("[bluetooth] Accept failed, stopping server: {}", e);
                break;
            }
        }
    }
    info!("[bluetooth] Accept loop stopped");
}

/// Answer requests on one connection until the peer closes it
pub fn serve_client(stream: impl Duplex + 'static, web_root: &WebRoot) -> Result<()> {
    let mut connection = BluetoothConnection::new(stream);
    loop {
        let request = match Request::read_from(&mut connection) {
            Ok(request) => request,
            // clean hang-up between requests
            Err(Error::ConnectionFailed(_)) => return Ok(()),
            Err(e) => {
                warn!("[bluetooth] Bad request: {}", e);
                let head = ResponseHead::new(500).with_header("content-length", "0");
                write_response(&mut connection, &head, None)?;
                return Err(e);
            }
        };

        debug!("[bluetooth] {} {}", request.method, request.path);
        let response = web_root.respond(&web_request(&request));
        send(&mut connection, request.method, response)?;
    }
}

fn web_request(request: &Request) -> WebRequest {
    let header = |name: &str| request.headers.get(name).cloned();
    WebRequest {
        path: format!("/{}", request.path),
        range: header("range"),
        if_range: header("if-range"),
        if_none_match: header("if-none-match"),
    }
}

fn send(connection: &mut BluetoothConnection, method: Method, response: WebResponse) -> io::Result<()> {
    let mut head = ResponseHead::new(response.status)
        .with_header("content-length", response.content_length().to_string());
    for name in FORWARDED_HEADERS {
        if let Some(value) = response.header(name) {
            head = head.with_header(name, value);
        }
    }

    match method {
        Method::Head => write_response(connection, &head, None),
        Method::Get => {
            let mut body = response.body.into_reader();
            write_response(connection, &head, Some(&mut body))
        }
    }
}
