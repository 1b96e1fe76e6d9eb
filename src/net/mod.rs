// src/net/mod.rs
//! Transport-neutral download contract
//!
//! Every transport (HTTP, Tor, local file, document tree, Bluetooth)
//! implements [`Downloader`]: it streams one named resource into one local
//! file, reports throttled progress and honours cooperative cancellation.
//!
//! # Cancellation points
//!
//! [`download_from_stream`] checks the session's [`CancelToken`] after the
//! byte stream is acquired, after every read call returns, and once more
//! after the stream is exhausted. Dropping any of these checks makes a
//! transfer un-cancellable, so transports must go through this loop rather
//! than copying bytes themselves.
//!
//! # Resumption
//!
//! When a transport supports byte ranges, an existing partial file is kept,
//! opened in append mode, and the stream is requested from its current
//! length. Non-resumable transfers truncate the file first.

pub mod apk;
pub mod bluetooth;
pub mod coordinator;
pub mod dns;
pub mod factory;
pub mod http;
pub mod local_file;
pub mod mirror;
pub(crate) mod persist;
pub mod tor;
pub mod tree;

pub use apk::{ApkDownloader, ApkEvent, ArtifactCache, ArtifactDescriptor, DirectoryCache};
pub use coordinator::{DownloadCoordinator, DownloadEvent, DownloadEventKind, DownloadRequest};
pub use factory::{DownloaderFactory, RepoCredentials, RepositoryLookup};
pub use mirror::{Mirror, MirrorManager};

use crate::error::{Error, Result};
use crate::progress::{ProgressListener, ProgressReporter};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Buffer size for streaming downloads (8 KB)
pub const STREAM_BUFFER_SIZE: usize = 8192;

// =============================================================================
// Cancellation and cleanup primitives
// =============================================================================

/// Write-once cancellation flag shared between a transfer and its owner
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise [`Error::Interrupted`] once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            debug!("Received interrupt, cancelling download");
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Runs a transport's release hook exactly once
///
/// Cloned into every [`ByteStream`] so that dropping a half-read stream
/// releases the transport just like an explicit `close()`.
#[derive(Clone, Default)]
pub struct Closer {
    closed: Arc<AtomicBool>,
    hook: Arc<Mutex<Option<CloseHook>>>,
}

impl Closer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the release hook; ignored once closed
    pub fn set_hook(&self, hook: impl FnOnce() + Send + 'static) {
        if !self.is_closed() {
            *self.hook.lock() = Some(Box::new(hook));
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = self.hook.lock().take() {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer").field("closed", &self.is_closed()).finish()
    }
}

/// Byte stream handed out by [`Downloader::open`]
///
/// Closing (dropping) the stream closes the transport that produced it.
pub struct ByteStream {
    inner: Box<dyn Read + Send>,
    closer: Closer,
}

impl ByteStream {
    pub fn new(inner: impl Read + Send + 'static, closer: Closer) -> Self {
        Self {
            inner: Box::new(inner),
            closer,
        }
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        self.closer.close();
    }
}

// =============================================================================
// Session state
// =============================================================================

/// Transient state of one transfer; never reused across artifacts
#[derive(Debug)]
pub struct DownloadSession {
    source: String,
    output: PathBuf,
    timeout: Duration,
    cache_tag: Option<String>,
    bytes_read: u64,
    total_bytes: Option<u64>,
    cancel: CancelToken,
}

impl DownloadSession {
    pub fn new(source: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            timeout: Duration::from_millis(crate::config::DEFAULT_TIMEOUT_MS),
            cache_tag: None,
            bytes_read: 0,
            total_bytes: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Validator from the last successful round-trip, or the one supplied
    /// by the caller before `download()`
    pub fn cache_tag(&self) -> Option<&str> {
        self.cache_tag.as_deref()
    }

    pub fn set_cache_tag(&mut self, tag: Option<String>) {
        self.cache_tag = tag;
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn set_total_bytes(&mut self, total: Option<u64>) {
        self.total_bytes = total;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Share an externally owned token, e.g. the coordinator's
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }
}

// =============================================================================
// The transport contract
// =============================================================================

/// One transport's way of fetching one resource into one file
pub trait Downloader: Send {
    fn session(&self) -> &DownloadSession;

    fn session_mut(&mut self) -> &mut DownloadSession;

    /// Shared close-once guard for this transport
    fn closer(&self) -> &Closer;

    /// Acquire the byte stream, starting `offset` bytes into the resource
    ///
    /// Fails with `NotFound` when the resource is absent, `Protocol` for
    /// malformed responses, `ConnectionFailed` for timeouts, DNS and TLS
    /// failures.
    fn open(&mut self, offset: u64) -> Result<ByteStream>;

    /// Best-effort size of the whole resource
    fn total_size(&mut self) -> Result<Option<u64>>;

    /// False only when the transport confirmed the resource still matches
    /// the cache tag supplied before `download()`
    fn has_changed(&self) -> bool;

    /// Perform the transfer into [`DownloadSession::output`]
    fn download(&mut self, listener: &dyn ProgressListener) -> Result<()>;

    /// Release transport resources; idempotent
    fn close(&mut self) {
        self.closer().close();
    }

    fn source(&self) -> &str {
        self.session().source()
    }

    fn output_file(&self) -> &Path {
        self.session().output()
    }

    fn cancel_token(&self) -> CancelToken {
        self.session().cancel_token()
    }
}

/// Copy a transport's byte stream into its output file
///
/// `resumable` keeps the existing partial file and requests the remainder;
/// otherwise the file is truncated and the stream starts at zero.
pub fn download_from_stream<D: Downloader + ?Sized>(
    downloader: &mut D,
    resumable: bool,
    listener: &dyn ProgressListener,
) -> Result<()> {
    let output_path = downloader.output_file().to_path_buf();
    let offset = if resumable {
        fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0)
    } else {
        0
    };
    debug!(
        "Downloading {} from stream (offset {})",
        downloader.source(),
        offset
    );

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::IoError(format!("Failed to create directory {}: {e}", parent.display()))
        })?;
    }

    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .append(resumable)
        .truncate(!resumable)
        .open(&output_path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", output_path.display())))?;

    let mut input = downloader.open(offset)?;
    downloader.session().check_cancelled()?;

    let total = downloader.total_size()?;
    let copied = copy_with_progress(
        &mut input,
        &mut output,
        downloader.session_mut(),
        offset,
        total,
        listener,
    );
    drop(input);
    copied?;

    downloader.session().check_cancelled()
}

fn copy_with_progress(
    input: &mut ByteStream,
    output: &mut fs::File,
    session: &mut DownloadSession,
    offset: u64,
    total: Option<u64>,
    listener: &dyn ProgressListener,
) -> Result<()> {
    // bytes_read counts this transfer only; progress counts the whole file
    session.bytes_read = 0;
    session.total_bytes = total;

    let mut reporter = ProgressReporter::new(listener, session.source.clone());
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];

    reporter.report(offset, total);
    session.check_cancelled()?;

    loop {
        let count = match input.read(&mut buffer) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from_io(&session.source, e)),
        };

        session.check_cancelled()?;

        if count == 0 {
            debug!("Finished downloading from stream");
            break;
        }

        output
            .write_all(&buffer[..count])
            .map_err(|e| Error::IoError(format!("Failed to write data: {e}")))?;
        session.bytes_read += count as u64;
        reporter.report(offset + session.bytes_read, total);
    }

    output
        .flush()
        .map_err(|e| Error::IoError(format!("Failed to flush data: {e}")))?;
    reporter.finish(offset + session.bytes_read, total);
    Ok(())
}
