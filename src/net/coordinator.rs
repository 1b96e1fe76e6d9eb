// src/net/coordinator.rs

//! Single-worker download queue
//!
//! Requests are keyed by canonical URL (the artifact's identity, not the
//! mirror it is fetched from). Per canonical URL:
//!
//! ```text
//! Queued -> Active -> Complete | Interrupted | ConnectionFailed
//! ```
//!
//! Only one transfer is active per coordinator. Enqueueing a URL that is
//! already queued or active is a no-op, so repeated taps on "install" cannot
//! start a second transfer.
//!
//! Subscribers receive one `Started`, throttled `Progress` and exactly one
//! terminal event per transfer. A subscriber whose channel stays full for
//! [`LIFECYCLE_SEND_TIMEOUT`] is dropped instead. The terminal event is sent
//! after the transfer stops being active, so it is safe to re-enqueue from it.
//! Failures are classified, never retried here: mirror failover is the
//! caller's decision (see [`super::apk`]).

use super::factory::DownloaderFactory;
use super::{CancelToken, Downloader};
use crate::error::{Error, ErrorKind, Result};
use crate::progress::CallbackProgress;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Default per-subscriber channel capacity
pub const EVENT_CAPACITY: usize = 64;

/// How long a lifecycle event waits on a full subscriber before it is dropped
pub const LIFECYCLE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Creates the transport for a request; the factory in production
pub trait MakeDownloader: Send + Sync {
    fn make(&self, url: &Url, output: &Path) -> Result<Box<dyn Downloader>>;
}

impl MakeDownloader for DownloaderFactory {
    fn make(&self, url: &Url, output: &Path) -> Result<Box<dyn Downloader>> {
        self.create(url, output)
    }
}

/// One queued transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub repo_id: i64,
    /// Artifact identity, used for deduplication and events
    pub canonical_url: String,
    /// Mirror actually fetched from; the canonical URL when absent
    pub download_url: Option<String>,
    /// Validator remembered from an earlier download
    pub cache_tag: Option<String>,
}

impl DownloadRequest {
    pub fn new(repo_id: i64, canonical_url: impl Into<String>) -> Self {
        Self {
            repo_id,
            canonical_url: canonical_url.into(),
            download_url: None,
            cache_tag: None,
        }
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    pub fn with_cache_tag(mut self, tag: Option<String>) -> Self {
        self.cache_tag = tag;
        self
    }

    pub fn mirror_url(&self) -> &str {
        self.download_url.as_deref().unwrap_or(&self.canonical_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadEventKind {
    Started,
    Progress,
    Complete,
    Interrupted,
    ConnectionFailed,
}

impl DownloadEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Interrupted | Self::ConnectionFailed)
    }
}

/// Lifecycle broadcast for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEvent {
    pub kind: DownloadEventKind,
    pub repo_id: i64,
    pub canonical_url: String,
    pub mirror_url: String,
    /// Local file the transfer writes to
    pub path: PathBuf,
    pub bytes_read: u64,
    pub total_bytes: Option<u64>,
    /// False when the transport confirmed the cached copy is current
    pub changed: bool,
    pub cache_tag: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
}

impl DownloadEvent {
    fn new(kind: DownloadEventKind, request: &DownloadRequest, path: &Path) -> Self {
        Self {
            kind,
            repo_id: request.repo_id,
            canonical_url: request.canonical_url.clone(),
            mirror_url: request.mirror_url().to_string(),
            path: path.to_path_buf(),
            bytes_read: 0,
            total_bytes: None,
            changed: true,
            cache_tag: None,
            error_kind: None,
            message: None,
        }
    }

    fn failure(request: &DownloadRequest, path: &Path, err: &Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::ConnectionFailed | ErrorKind::NotFound => DownloadEventKind::ConnectionFailed,
            _ => DownloadEventKind::Interrupted,
        };
        Self {
            error_kind: Some(err.kind()),
            message: Some(err.to_string()),
            ..Self::new(kind, request, path)
        }
    }
}

/// Local file for a canonical URL: `<cache>/<host>-<port>/<last segment>`
pub fn destination_for(cache_dir: &Path, canonical_url: &str) -> Result<PathBuf> {
    let url = Url::parse(canonical_url)
        .map_err(|e| Error::Configuration(format!("Invalid URL {canonical_url}: {e}")))?;
    let host = url.host_str().unwrap_or("local");
    let port = url
        .port_or_known_default()
        .map(i32::from)
        .unwrap_or(-1);
    let name = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .ok_or_else(|| Error::Configuration(format!("No file name in {canonical_url}")))?;
    Ok(cache_dir.join(format!("{host}-{port}")).join(name))
}

// =============================================================================
// Event bus
// =============================================================================

#[derive(Default)]
struct EventBus {
    subscribers: Mutex<Vec<flume::Sender<DownloadEvent>>>,
}

impl EventBus {
    fn subscribe(&self, capacity: usize) -> flume::Receiver<DownloadEvent> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: DownloadEvent) {
        let senders: Vec<_> = self.subscribers.lock().clone();
        let mut dropped = Vec::new();

        for tx in &senders {
            let delivered = if event.kind == DownloadEventKind::Progress {
                // Slow subscribers miss progress; lifecycle events wait briefly
                !matches!(tx.try_send(event.clone()), Err(flume::TrySendError::Disconnected(_)))
            } else {
                match tx.send_timeout(event.clone(), LIFECYCLE_SEND_TIMEOUT) {
                    Ok(()) => true,
                    Err(flume::SendTimeoutError::Timeout(_)) => {
                        warn!("Dropping download subscriber that stopped reading events");
                        false
                    }
                    Err(flume::SendTimeoutError::Disconnected(_)) => false,
                }
            };
            if !delivered {
                dropped.push(tx.clone());
            }
        }

        if !dropped.is_empty() {
            self.subscribers
                .lock()
                .retain(|tx| !tx.is_disconnected() && !dropped.iter().any(|d| d.same_channel(tx)));
        }
    }

    fn len(&self) -> usize {
        self.subscribers.lock().len()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

struct Active {
    canonical_url: String,
    cancel: CancelToken,
}

#[derive(Default)]
struct State {
    queue: VecDeque<DownloadRequest>,
    active: Option<Active>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    bus: EventBus,
    maker: Arc<dyn MakeDownloader>,
    cache_dir: PathBuf,
}

/// Deduplicating single-worker transfer queue
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadCoordinator {
    /// Start the worker thread; files land under `cache_dir`
    pub fn new(maker: Arc<dyn MakeDownloader>, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            bus: EventBus::default(),
            maker,
            cache_dir: cache_dir.into(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("download-worker".into())
            .spawn(move || worker_shared.run())
            .map_err(|e| Error::InitError(format!("Failed to spawn download worker: {e}")))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Receive lifecycle events for every transfer from now on
    pub fn subscribe(&self) -> flume::Receiver<DownloadEvent> {
        self.shared.bus.subscribe(EVENT_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> flume::Receiver<DownloadEvent> {
        self.shared.bus.subscribe(capacity)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.bus.len()
    }

    /// Queue `canonical_url`, fetched from `download_url` when given
    ///
    /// Returns false when the request was ignored (empty URL, already queued
    /// or active, coordinator shut down).
    pub fn enqueue(&self, repo_id: i64, canonical_url: &str, download_url: Option<&str>) -> bool {
        let mut request = DownloadRequest::new(repo_id, canonical_url);
        request.download_url = download_url.map(str::to_string);
        self.enqueue_request(request)
    }

    pub fn enqueue_request(&self, request: DownloadRequest) -> bool {
        if request.canonical_url.is_empty() {
            debug!("Ignoring request with empty canonical URL");
            return false;
        }

        let mut state = self.shared.state.lock();
        if state.shutdown {
            warn!("Coordinator shut down, dropping {}", request.canonical_url);
            return false;
        }
        if state.is_queued_or_active(&request.canonical_url) {
            debug!("{} already queued or active", request.canonical_url);
            return false;
        }

        debug!("Queueing {} from {}", request.canonical_url, request.mirror_url());
        state.queue.push_back(request);
        self.shared.wake.notify_one();
        true
    }

    /// Cancel a queued or active transfer
    ///
    /// A queued request is dropped silently. An active one is asked to stop
    /// and will report `Interrupted`. Anything else is a logged no-op.
    pub fn cancel(&self, canonical_url: &str) -> bool {
        let mut state = self.shared.state.lock();

        if let Some(active) = &state.active
            && active.canonical_url == canonical_url
        {
            info!("Cancelling active download {}", canonical_url);
            active.cancel.cancel();
            return true;
        }

        let before = state.queue.len();
        state.queue.retain(|r| r.canonical_url != canonical_url);
        if state.queue.len() != before {
            info!("Removed {} from the download queue", canonical_url);
            return true;
        }

        debug!("Cancel for {} ignored, not queued or active", canonical_url);
        false
    }

    pub fn is_active(&self, canonical_url: &str) -> bool {
        self.shared
            .state
            .lock()
            .active
            .as_ref()
            .is_some_and(|a| a.canonical_url == canonical_url)
    }

    pub fn is_queued_or_active(&self, canonical_url: &str) -> bool {
        self.shared.state.lock().is_queued_or_active(canonical_url)
    }

    /// Local file a canonical URL downloads to
    pub fn destination(&self, canonical_url: &str) -> Result<PathBuf> {
        destination_for(&self.shared.cache_dir, canonical_url)
    }

    /// Stop the worker, cancelling the active transfer and dropping the queue
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.queue.clear();
            if let Some(active) = &state.active {
                active.cancel.cancel();
            }
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            error!("Download worker panicked");
        }
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl State {
    fn is_queued_or_active(&self, canonical_url: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.canonical_url == canonical_url)
            || self.queue.iter().any(|r| r.canonical_url == canonical_url)
    }
}

impl Shared {
    fn run(&self) {
        debug!("Download worker started");
        loop {
            let (request, cancel) = {
                let mut state = self.state.lock();
                while state.queue.is_empty() && !state.shutdown {
                    self.wake.wait(&mut state);
                }
                if state.shutdown {
                    break;
                }
                let Some(request) = state.queue.pop_front() else {
                    continue;
                };
                let cancel = CancelToken::new();
                state.active = Some(Active {
                    canonical_url: request.canonical_url.clone(),
                    cancel: cancel.clone(),
                });
                (request, cancel)
            };

            let terminal = self.handle(&request, cancel);
            // Clear first so a subscriber reacting to the event can re-enqueue
            self.state.lock().active = None;
            self.bus.publish(terminal);
        }
        debug!("Download worker stopped");
    }

    /// Run one transfer and return its terminal event
    fn handle(&self, request: &DownloadRequest, cancel: CancelToken) -> DownloadEvent {
        let path = match destination_for(&self.cache_dir, &request.canonical_url) {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot place {}: {}", request.canonical_url, e);
                return DownloadEvent::failure(request, Path::new(""), &e);
            }
        };

        self.bus
            .publish(DownloadEvent::new(DownloadEventKind::Started, request, &path));

        match self.transfer(request, &path, cancel) {
            Ok(done) => done,
            Err(e) => {
                match e.kind() {
                    ErrorKind::Interrupted => info!("Download of {} interrupted", request.canonical_url),
                    _ => warn!("Download of {} failed: {:?}", request.mirror_url(), e),
                }
                DownloadEvent::failure(request, &path, &e)
            }
        }
    }

    fn transfer(&self, request: &DownloadRequest, path: &Path, cancel: CancelToken) -> Result<DownloadEvent> {
        let url = Url::parse(request.mirror_url())
            .map_err(|e| Error::Configuration(format!("Invalid URL {}: {e}", request.mirror_url())))?;
        let mut downloader = self.maker.make(&url, path)?;
        downloader.session_mut().set_cancel_token(cancel);
        downloader.session_mut().set_cache_tag(request.cache_tag.clone());

        let listener = CallbackProgress::new(|_: &str, bytes_read, total_bytes| {
            let mut event = DownloadEvent::new(DownloadEventKind::Progress, request, path);
            event.bytes_read = bytes_read;
            event.total_bytes = total_bytes;
            self.bus.publish(event);
        });

        let result = downloader.download(&listener);
        downloader.close();
        result?;

        let session = downloader.session();
        Ok(DownloadEvent {
            bytes_read: session.bytes_read(),
            total_bytes: session.total_bytes(),
            changed: downloader.has_changed(),
            cache_tag: session.cache_tag().map(str::to_string),
            ..DownloadEvent::new(DownloadEventKind::Complete, request, path)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::local_file::LocalFileDownloader;
    use std::fs;
    use std::time::Duration;

    /// Serves `file://` URLs, optionally holding each transfer until released
    pub(crate) struct GatedMaker {
        pub(crate) gate: Arc<(Mutex<bool>, Condvar)>,
        pub(crate) made: Mutex<Vec<String>>,
    }

    impl GatedMaker {
        pub(crate) fn open() -> Arc<Self> {
            Self::with_gate(true)
        }

        pub(crate) fn closed() -> Arc<Self> {
            Self::with_gate(false)
        }

        fn with_gate(open: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new((Mutex::new(open), Condvar::new())),
                made: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn release(&self) {
            let (lock, cv) = &*self.gate;
            *lock.lock() = true;
            cv.notify_all();
        }
    }

    struct GatedDownloader {
        inner: LocalFileDownloader,
        gate: Arc<(Mutex<bool>, Condvar)>,
    }

    impl Downloader for GatedDownloader {
        fn session(&self) -> &crate::net::DownloadSession {
            self.inner.session()
        }
        fn session_mut(&mut self) -> &mut crate::net::DownloadSession {
            self.inner.session_mut()
        }
        fn closer(&self) -> &crate::net::Closer {
            self.inner.closer()
        }
        fn open(&mut self, offset: u64) -> Result<crate::net::ByteStream> {
            self.inner.open(offset)
        }
        fn total_size(&mut self) -> Result<Option<u64>> {
            self.inner.total_size()
        }
        fn has_changed(&self) -> bool {
            true
        }
        fn download(&mut self, listener: &dyn crate::progress::ProgressListener) -> Result<()> {
            let (lock, cv) = &*self.gate;
            let mut open = lock.lock();
            while !*open {
                cv.wait_for(&mut open, Duration::from_millis(20));
                if self.session().check_cancelled().is_err() {
                    return Err(Error::Interrupted);
                }
            }
            drop(open);
            self.inner.download(listener)
        }
    }

    impl MakeDownloader for GatedMaker {
        fn make(&self, url: &Url, output: &Path) -> Result<Box<dyn Downloader>> {
            self.made.lock().push(url.to_string());
            Ok(Box::new(GatedDownloader {
                inner: LocalFileDownloader::new(url, output)?,
                gate: Arc::clone(&self.gate),
            }))
        }
    }

    pub(crate) fn recv_terminal(rx: &flume::Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(10)) {
            let done = event.kind.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn test_destination_layout() {
        let cache = Path::new("/cache");
        assert_eq!(
            destination_for(cache, "https://f-droid.org/repo/org.example_3.apk").unwrap(),
            Path::new("/cache/f-droid.org-443/org.example_3.apk")
        );
        assert_eq!(
            destination_for(cache, "http://192.168.1.5:8888/fdroid/repo/a.apk").unwrap(),
            Path::new("/cache/192.168.1.5-8888/a.apk")
        );
        assert_eq!(
            destination_for(cache, "bluetooth://00-1A-7D-DA-71-13/fdroid/repo/b.apk").unwrap(),
            Path::new("/cache/00-1A-7D-DA-71-13--1/b.apk")
        );
        assert!(destination_for(cache, "https://f-droid.org/").is_err());
    }

    #[test]
    fn test_complete_event_sequence() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::write(src.path().join("app.apk"), vec![5u8; 4096]).unwrap();
        let url = Url::from_file_path(src.path().join("app.apk")).unwrap();

        let coordinator = DownloadCoordinator::new(GatedMaker::open(), cache.path()).unwrap();
        let rx = coordinator.subscribe();
        assert!(coordinator.enqueue(3, url.as_str(), None));

        let events = recv_terminal(&rx);
        assert_eq!(events.first().unwrap().kind, DownloadEventKind::Started);
        let last = events.last().unwrap();
        assert_eq!(last.kind, DownloadEventKind::Complete);
        assert_eq!(last.repo_id, 3);
        assert_eq!(fs::read(&last.path).unwrap().len(), 4096);
        assert!(events.iter().filter(|e| e.kind.is_terminal()).count() == 1);
    }

    #[test]
    fn test_duplicate_enqueue_starts_once() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::write(src.path().join("app.apk"), b"apk").unwrap();
        let url = Url::from_file_path(src.path().join("app.apk")).unwrap();

        let maker = GatedMaker::closed();
        let coordinator = DownloadCoordinator::new(maker.clone(), cache.path()).unwrap();
        let rx = coordinator.subscribe();

        assert!(coordinator.enqueue(1, url.as_str(), None));
        assert!(!coordinator.enqueue(1, url.as_str(), None));
        assert!(coordinator.is_queued_or_active(url.as_str()));
        maker.release();

        let events = recv_terminal(&rx);
        let started = events
            .iter()
            .filter(|e| e.kind == DownloadEventKind::Started)
            .count();
        assert_eq!(started, 1);
        assert_eq!(maker.made.lock().len(), 1);
    }

    #[test]
    fn test_cancel_active_reports_interrupted() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::write(src.path().join("app.apk"), b"apk").unwrap();
        let url = Url::from_file_path(src.path().join("app.apk")).unwrap();

        let maker = GatedMaker::closed();
        let coordinator = DownloadCoordinator::new(maker.clone(), cache.path()).unwrap();
        let rx = coordinator.subscribe();
        coordinator.enqueue(1, url.as_str(), None);

        let started = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(started.kind, DownloadEventKind::Started);
        assert!(coordinator.is_active(url.as_str()));
        assert!(coordinator.cancel(url.as_str()));

        let events = recv_terminal(&rx);
        let last = events.last().unwrap();
        assert_eq!(last.kind, DownloadEventKind::Interrupted);
        assert_eq!(last.error_kind, Some(ErrorKind::Interrupted));
        assert!(!events.iter().any(|e| e.kind == DownloadEventKind::Complete));
    }

    #[test]
    fn test_cancel_queued_and_unknown() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.apk"), b"a").unwrap();
        fs::write(src.path().join("b.apk"), b"b").unwrap();
        let a = Url::from_file_path(src.path().join("a.apk")).unwrap();
        let b = Url::from_file_path(src.path().join("b.apk")).unwrap();

        let maker = GatedMaker::closed();
        let coordinator = DownloadCoordinator::new(maker.clone(), cache.path()).unwrap();
        let rx = coordinator.subscribe();
        coordinator.enqueue(1, a.as_str(), None);
        coordinator.enqueue(1, b.as_str(), None);

        assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
        assert!(coordinator.cancel(b.as_str()));
        assert!(!coordinator.is_queued_or_active(b.as_str()));
        assert!(!coordinator.cancel("https://example.org/never-queued.apk"));
        assert!(!coordinator.enqueue(1, "", None));

        maker.release();
        let events = recv_terminal(&rx);
        assert_eq!(events.last().unwrap().kind, DownloadEventKind::Complete);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(maker.made.lock().len(), 1);
    }

    #[test]
    fn test_missing_source_is_connection_failed() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(src.path().join("missing.apk")).unwrap();

        let coordinator = DownloadCoordinator::new(GatedMaker::open(), cache.path()).unwrap();
        let rx = coordinator.subscribe();
        coordinator.enqueue(1, url.as_str(), None);

        let last = recv_terminal(&rx).pop().unwrap();
        assert_eq!(last.kind, DownloadEventKind::ConnectionFailed);
        assert_eq!(last.error_kind, Some(ErrorKind::NotFound));
        assert!(last.message.is_some());
    }

    #[test]
    fn test_mirror_url_used_for_fetch() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::write(src.path().join("app.apk"), b"mirror").unwrap();
        let mirror = Url::from_file_path(src.path().join("app.apk")).unwrap();

        let maker = GatedMaker::open();
        let coordinator = DownloadCoordinator::new(maker.clone(), cache.path()).unwrap();
        let rx = coordinator.subscribe();
        let canonical = "https://f-droid.org/repo/app.apk";
        coordinator.enqueue(2, canonical, Some(mirror.as_str()));

        let last = recv_terminal(&rx).pop().unwrap();
        assert_eq!(last.kind, DownloadEventKind::Complete);
        assert_eq!(last.canonical_url, canonical);
        assert_eq!(last.mirror_url, mirror.as_str());
        assert!(last.path.ends_with("f-droid.org-443/app.apk"));
        assert_eq!(maker.made.lock().as_slice(), &[mirror.to_string()]);
    }

    #[test]
    fn test_reenqueue_on_terminal_event_is_accepted() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::write(src.path().join("good.apk"), b"mirror copy").unwrap();
        let missing = Url::from_file_path(src.path().join("missing.apk")).unwrap();
        let good = Url::from_file_path(src.path().join("good.apk")).unwrap();
        let canonical = "https://f-droid.org/repo/good.apk";

        let coordinator = DownloadCoordinator::new(GatedMaker::open(), cache.path()).unwrap();
        for _ in 0..50 {
            let _ = fs::remove_file(coordinator.destination(canonical).unwrap());
            let rx = coordinator.subscribe();
            assert!(coordinator.enqueue(1, canonical, Some(missing.as_str())));
            let failed = recv_terminal(&rx).pop().unwrap();
            assert_eq!(failed.kind, DownloadEventKind::ConnectionFailed);

            // Failing over right away must not find the old transfer active
            assert!(!coordinator.is_queued_or_active(canonical));
            assert!(coordinator.enqueue(1, canonical, Some(good.as_str())));
            let done = recv_terminal(&rx).pop().unwrap();
            assert_eq!(done.kind, DownloadEventKind::Complete);
        }
    }

    #[test]
    fn test_stalled_subscriber_does_not_block_worker() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let coordinator = DownloadCoordinator::new(GatedMaker::open(), cache.path()).unwrap();

        let stalled = coordinator.subscribe_with_capacity(1);
        let live = coordinator.subscribe();
        assert_eq!(coordinator.subscriber_count(), 2);

        for i in 0..4 {
            let name = format!("app{i}.apk");
            fs::write(src.path().join(&name), b"apk").unwrap();
            let url = Url::from_file_path(src.path().join(&name)).unwrap();
            assert!(coordinator.enqueue(1, url.as_str(), None));
            let last = recv_terminal(&live).pop().unwrap();
            assert_eq!(last.kind, DownloadEventKind::Complete);
        }

        // Kept alive but never drained, so it was dropped from the bus
        assert_eq!(coordinator.subscriber_count(), 1);
        assert_eq!(stalled.len(), 1);
        coordinator.shutdown();
    }
}
