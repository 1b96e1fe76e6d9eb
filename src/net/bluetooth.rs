// src/net/bluetooth.rs

//! `bluetooth://<mac-with-dashes>/<path>` transport
//!
//! One RFCOMM connection per download: a `HEAD` learns the size, then a
//! `GET` on the same connection streams the body. Not resumable, and always
//! considered changed.

use super::{ByteStream, Closer, DownloadSession, Downloader, download_from_stream};
use crate::bluetooth::protocol::{Method, Request, ResponseHead};
use crate::bluetooth::{BluetoothAddress, BluetoothConnection, BluetoothConnector};
use crate::error::{Error, Result};
use crate::progress::ProgressListener;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use url::Url;

pub const SCHEME: &str = "bluetooth";

pub struct BluetoothDownloader {
    session: DownloadSession,
    closer: Closer,
    connector: Arc<dyn BluetoothConnector>,
    address: BluetoothAddress,
    path: String,
    connection: Option<BluetoothConnection>,
    details: Option<ResponseHead>,
}

impl BluetoothDownloader {
    pub fn new(url: &Url, output: &Path, connector: Arc<dyn BluetoothConnector>) -> Result<Self> {
        let address: BluetoothAddress = url
            .host_str()
            .ok_or_else(|| Error::Configuration(format!("No device address in {url}")))?
            .parse()?;

        Ok(Self {
            session: DownloadSession::new(url.as_str(), output),
            closer: Closer::new(),
            connector,
            address,
            path: url.path().trim_start_matches('/').to_string(),
            connection: None,
            details: None,
        })
    }

    fn connection(&mut self) -> Result<&mut BluetoothConnection> {
        if self.connection.is_none() {
            debug!("[bluetooth] Connecting to {}", self.address);
            let conn = self.connector.connect(self.address, self.session.timeout())?;
            self.connection = Some(conn);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| Error::ConnectionFailed("Bluetooth connection closed".into()))
    }

    fn exchange(&mut self, method: Method) -> Result<ResponseHead> {
        let request = Request::new(method, &self.path);
        let source = self.session.source().to_string();
        let conn = self.connection()?;
        request
            .write_to(conn)
            .map_err(|e| Error::from_io(&source, e))?;
        let head = ResponseHead::read_from(conn)?;

        match head.status {
            200 => Ok(head),
            404 => Err(Error::NotFound(source)),
            status => Err(Error::Protocol(format!("Bluetooth peer answered {status} for {source}"))),
        }
    }

    /// Size and validator of the remote file
    pub fn file_details(&mut self) -> Result<&ResponseHead> {
        if self.details.is_none() {
            let head = self.exchange(Method::Head)?;
            self.details = Some(head);
        }
        self.details
            .as_ref()
            .ok_or_else(|| Error::Protocol("Missing file details".into()))
    }
}

impl Downloader for BluetoothDownloader {
    fn session(&self) -> &DownloadSession {
        &self.session
    }

    fn session_mut(&mut self) -> &mut DownloadSession {
        &mut self.session
    }

    fn closer(&self) -> &Closer {
        &self.closer
    }

    fn open(&mut self, _offset: u64) -> Result<ByteStream> {
        let head = self.exchange(Method::Get)?;
        let length = head.content_length().unwrap_or(0);
        if let Some(tag) = head.etag() {
            self.session.set_cache_tag(Some(tag.to_string()));
        }
        let conn = self
            .connection
            .take()
            .ok_or_else(|| Error::ConnectionFailed("Bluetooth connection closed".into()))?;
        Ok(ByteStream::new(conn.take(length), self.closer.clone()))
    }

    fn total_size(&mut self) -> Result<Option<u64>> {
        Ok(self.file_details()?.content_length())
    }

    fn has_changed(&self) -> bool {
        true
    }

    fn download(&mut self, listener: &dyn ProgressListener) -> Result<()> {
        self.file_details()?;
        download_from_stream(self, false, listener)
    }

    fn close(&mut self) {
        self.connection = None;
        self.closer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::protocol::write_response;
    use crate::progress::SilentProgress;
    use parking_lot::Mutex;
    use std::io::{self, Cursor, Write};
    use std::time::Duration;

    /// Replays canned responses and records what the client sent
    struct ScriptedStream {
        incoming: Cursor<Vec<u8>>,
        sent: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedConnector {
        script: Vec<u8>,
        sent: Arc<Mutex<Vec<u8>>>,
    }

    impl BluetoothConnector for ScriptedConnector {
        fn connect(&self, _: BluetoothAddress, _: Duration) -> Result<BluetoothConnection> {
            Ok(BluetoothConnection::new(ScriptedStream {
                incoming: Cursor::new(self.script.clone()),
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    fn response(status: u16, body: &[u8], include_body: bool) -> Vec<u8> {
        let head = ResponseHead::new(status).with_header("Content-Length", body.len().to_string());
        let mut wire = Vec::new();
        let mut reader = Cursor::new(body.to_vec());
        let body: Option<&mut dyn Read> = if include_body { Some(&mut reader) } else { None };
        write_response(&mut wire, &head, body).unwrap();
        wire
    }

    #[test]
    fn test_head_then_get() {
        let mut script = response(200, b"apk-bytes", false);
        script.extend(response(200, b"apk-bytes", true));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let connector = Arc::new(ScriptedConnector {
            script,
            sent: Arc::clone(&sent),
        });

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("app.apk");
        let url = Url::parse("bluetooth://00-1A-7D-DA-71-13/fdroid/repo/app.apk").unwrap();
        let mut downloader = BluetoothDownloader::new(&url, &out, connector).unwrap();

        downloader.download(&SilentProgress).unwrap();
        downloader.close();

        assert_eq!(std::fs::read(&out).unwrap(), b"apk-bytes");
        assert_eq!(downloader.session().total_bytes(), Some(9));
        assert!(downloader.has_changed());
        assert_eq!(
            String::from_utf8(sent.lock().clone()).unwrap(),
            "HEAD fdroid/repo/app.apk\n\nGET fdroid/repo/app.apk\n\n"
        );
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let connector = Arc::new(ScriptedConnector {
            script: response(404, b"", false),
            sent: Arc::new(Mutex::new(Vec::new())),
        });
        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse("bluetooth://00-1A-7D-DA-71-13/missing.apk").unwrap();
        let mut downloader =
            BluetoothDownloader::new(&url, &dir.path().join("x"), connector).unwrap();

        let err = downloader.download(&SilentProgress).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn test_bad_address() {
        let connector = Arc::new(crate::bluetooth::RfcommConnector::default());
        let url = Url::parse("bluetooth://not-a-mac/x.apk").unwrap();
        assert!(BluetoothDownloader::new(&url, Path::new("/tmp/x"), connector).is_err());
    }
}
