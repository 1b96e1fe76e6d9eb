// src/net/apk.rs

//! Verified package downloads
//!
//! [`ApkDownloader::fetch`] never hands out a file whose digest it has not
//! checked:
//!
//! 1. a copy in the [`ArtifactCache`] or at the download destination is
//!    verified and reused, or deleted when it does not match
//! 2. otherwise the coordinator fetches it from the best ranked mirror
//! 3. the finished file is verified again; a mismatch deletes it
//!
//! Connection failures and missing files move on to the next mirror and are
//! charged to the mirror that failed.

use super::coordinator::{DownloadCoordinator, DownloadEvent, DownloadEventKind, DownloadRequest};
use super::mirror::{Mirror, MirrorManager};
use crate::error::{Error, ErrorKind, Result};
use crate::hash::{FileHasher, HashAlgorithm};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Downloaded file did not match the expected digest
pub const HASH_MISMATCH: i32 = 101;
/// Transfer failed on every mirror, or was interrupted
pub const DOWNLOAD_FAILED: i32 = 102;
/// Setup problem such as an unsupported digest algorithm
pub const UNKNOWN_ERROR: i32 = 103;

/// Error code reported to the presentation layer
pub fn error_code(err: &Error) -> i32 {
    match err.kind() {
        ErrorKind::VerificationFailed => HASH_MISMATCH,
        ErrorKind::Configuration => UNKNOWN_ERROR,
        _ => DOWNLOAD_FAILED,
    }
}

/// Everything needed to fetch and verify one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub repo_id: i64,
    /// Identity of the artifact, normally on the repository's primary address
    pub canonical_url: String,
    /// Path relative to a mirror's base URL
    pub relative_path: String,
    pub file_name: String,
    /// Expected digest, hex encoded
    pub hash: String,
    pub hash_algorithm: String,
    pub size: Option<u64>,
    pub mirrors: Vec<Mirror>,
}

impl ArtifactDescriptor {
    pub fn new(repo_id: i64, canonical_url: &str, hash: &str) -> Self {
        let file_name = canonical_url
            .rsplit('/')
            .next()
            .unwrap_or(canonical_url)
            .to_string();
        Self {
            repo_id,
            canonical_url: canonical_url.to_string(),
            relative_path: file_name.clone(),
            file_name,
            hash: hash.to_string(),
            hash_algorithm: HashAlgorithm::Sha256.name().to_string(),
            size: None,
            mirrors: Vec::new(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: &str) -> Self {
        self.hash_algorithm = algorithm.to_string();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mirrors(mut self, mirrors: Vec<Mirror>) -> Self {
        self.mirrors = mirrors;
        self
    }

    pub fn with_relative_path(mut self, path: &str) -> Self {
        self.relative_path = path.trim_start_matches('/').to_string();
        self
    }
}

// =============================================================================
// Artifact cache
// =============================================================================

/// Long-lived store of verified packages, keyed by file name
pub trait ArtifactCache: Send + Sync {
    fn lookup(&self, file_name: &str) -> Option<PathBuf>;

    /// Copy `path` into the cache, returning the cached location
    fn store(&self, path: &Path, file_name: &str) -> Result<PathBuf>;
}

/// Cache living in one flat directory
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    dir: PathBuf,
}

impl DirectoryCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry(&self, file_name: &str) -> Option<PathBuf> {
        let name = Path::new(file_name).file_name()?;
        Some(self.dir.join(name))
    }
}

impl ArtifactCache for DirectoryCache {
    fn lookup(&self, file_name: &str) -> Option<PathBuf> {
        self.entry(file_name).filter(|p| p.is_file())
    }

    fn store(&self, path: &Path, file_name: &str) -> Result<PathBuf> {
        let target = self
            .entry(file_name)
            .ok_or_else(|| Error::Configuration(format!("Invalid file name: {file_name}")))?;
        fs::create_dir_all(&self.dir)?;
        if path != target {
            let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            fs::copy(path, tmp.path())?;
            tmp.persist(&target)
                .map_err(|e| Error::IoError(format!("Failed to cache {file_name}: {}", e.error)))?;
        }
        debug!("Cached {} at {}", file_name, target.display());
        Ok(target)
    }
}

/// True when `path` holds the expected bytes; anything else is deleted
///
/// Calling this twice in a row gives the same answer and leaves the file in
/// the same state.
pub fn verify_or_delete(path: &Path, expected_hash: &str, algorithm: &str) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let hasher = FileHasher::new(algorithm, path)?;
    if hasher.matches(expected_hash) {
        debug!("Using cached file at {}", path.display());
        return Ok(true);
    }

    debug!("Not using cached file at {}", path.display());
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to delete {}: {}", path.display(), e);
    }
    Ok(false)
}

// =============================================================================
// Use case
// =============================================================================

/// Outcome notifications for package fetches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApkEvent {
    Progress {
        canonical_url: String,
        bytes_read: u64,
        total_bytes: Option<u64>,
    },
    MirrorFailed {
        canonical_url: String,
        mirror: String,
        error_count: u32,
    },
    Complete {
        canonical_url: String,
        path: PathBuf,
        from_cache: bool,
    },
    Failed {
        canonical_url: String,
        code: i32,
        kind: ErrorKind,
        message: String,
    },
}

pub struct ApkDownloader {
    coordinator: Arc<DownloadCoordinator>,
    mirrors: Arc<MirrorManager>,
    cache: Option<Arc<dyn ArtifactCache>>,
    keep_artifacts: bool,
    listeners: Mutex<Vec<flume::Sender<ApkEvent>>>,
}

impl ApkDownloader {
    pub fn new(coordinator: Arc<DownloadCoordinator>, mirrors: Arc<MirrorManager>) -> Self {
        Self {
            coordinator,
            mirrors,
            cache: None,
            keep_artifacts: false,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Reuse and (when `keep_artifacts`) populate an artifact cache
    pub fn with_cache(mut self, cache: Arc<dyn ArtifactCache>, keep_artifacts: bool) -> Self {
        self.cache = Some(cache);
        self.keep_artifacts = keep_artifacts;
        self
    }

    pub fn subscribe(&self) -> flume::Receiver<ApkEvent> {
        let (tx, rx) = flume::unbounded();
        self.listeners.lock().push(tx);
        rx
    }

    fn emit(&self, event: ApkEvent) {
        self.listeners.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn fail(&self, descriptor: &ArtifactDescriptor, err: Error) -> Error {
        let code = error_code(&err);
        error!("Fetching {} failed ({}): {}", descriptor.canonical_url, code, err);
        self.emit(ApkEvent::Failed {
            canonical_url: descriptor.canonical_url.clone(),
            code,
            kind: err.kind(),
            message: err.to_string(),
        });
        err
    }

    /// Cancel an in-flight fetch of `canonical_url`
    pub fn cancel(&self, canonical_url: &str) -> bool {
        self.coordinator.cancel(canonical_url)
    }

    /// Block until the package is on disk and verified
    pub fn fetch(&self, descriptor: &ArtifactDescriptor) -> Result<PathBuf> {
        match self.fetch_inner(descriptor) {
            Ok(path) => Ok(path),
            Err(e) => Err(self.fail(descriptor, e)),
        }
    }

    fn fetch_inner(&self, descriptor: &ArtifactDescriptor) -> Result<PathBuf> {
        // Unknown algorithms are a configuration error before any I/O
        descriptor.hash_algorithm.parse::<HashAlgorithm>()?;

        let destination = self.coordinator.destination(&descriptor.canonical_url)?;
        if let Some(path) = self.reuse_local_copy(descriptor, &destination)? {
            self.emit(ApkEvent::Complete {
                canonical_url: descriptor.canonical_url.clone(),
                path: path.clone(),
                from_cache: true,
            });
            return Ok(path);
        }

        let mut tried: Vec<Mirror> = Vec::new();
        let mut last_error: Option<Error> = None;

        loop {
            let mirror = if descriptor.mirrors.is_empty() && tried.is_empty() {
                None
            } else {
                match self.mirrors.next_mirror(&descriptor.mirrors, &tried) {
                    Some(m) => Some(m),
                    None => break,
                }
            };

            let download_url = match &mirror {
                Some(m) => m.url_for(&descriptor.relative_path)?.to_string(),
                None => descriptor.canonical_url.clone(),
            };
            info!("Downloading {} from {}", descriptor.file_name, download_url);

            match self.download_once(descriptor, &download_url) {
                Ok(event) => {
                    if let Some(m) = &mirror {
                        self.mirrors.record_success(m);
                    }
                    return self.finish(descriptor, &event.path);
                }
                Err(e) if e.is_failover_candidate() => {
                    match mirror {
                        Some(m) => {
                            let count = self.mirrors.record_failure(&m);
                            self.emit(ApkEvent::MirrorFailed {
                                canonical_url: descriptor.canonical_url.clone(),
                                mirror: m.base_url.clone(),
                                error_count: count,
                            });
                            tried.push(m);
                            last_error = Some(e);
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::ConnectionFailed(format!("No usable mirror for {}", descriptor.canonical_url))
        }))
    }

    /// Verified copy from the cache or an earlier download, if any
    fn reuse_local_copy(
        &self,
        descriptor: &ArtifactDescriptor,
        destination: &Path,
    ) -> Result<Option<PathBuf>> {
        if let Some(cache) = &self.cache
            && let Some(cached) = cache.lookup(&descriptor.file_name)
            && verify_or_delete(&cached, &descriptor.hash, &descriptor.hash_algorithm)?
        {
            if cached != destination {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&cached, destination)?;
            }
            return Ok(Some(destination.to_path_buf()));
        }

        // A shorter file is a partial download worth resuming
        let complete_size = match (fs::metadata(destination), descriptor.size) {
            (Ok(meta), Some(size)) => meta.len() >= size,
            (Ok(_), None) => true,
            (Err(_), _) => false,
        };
        if complete_size
            && verify_or_delete(destination, &descriptor.hash, &descriptor.hash_algorithm)?
        {
            return Ok(Some(destination.to_path_buf()));
        }
        Ok(None)
    }

    /// One coordinator round-trip, returning its `Complete` event
    fn download_once(&self, descriptor: &ArtifactDescriptor, download_url: &str) -> Result<DownloadEvent> {
        let events = self.coordinator.subscribe();
        let request = DownloadRequest::new(descriptor.repo_id, &descriptor.canonical_url)
            .with_download_url(download_url);
        if !self.coordinator.enqueue_request(request.clone()) {
            if self.coordinator.is_queued_or_active(&descriptor.canonical_url) {
                debug!("{} already in progress, waiting for it", descriptor.canonical_url);
            } else if !self.coordinator.enqueue_request(request) {
                // Not running and not accepted: shut down or unusable URL
                return Err(Error::Interrupted);
            }
        }

        loop {
            let event = events
                .recv()
                .map_err(|_| Error::Interrupted)?;
            if event.canonical_url != descriptor.canonical_url {
                continue;
            }
            match event.kind {
                DownloadEventKind::Started => {}
                DownloadEventKind::Progress => self.emit(ApkEvent::Progress {
                    canonical_url: event.canonical_url.clone(),
                    bytes_read: event.bytes_read,
                    total_bytes: event.total_bytes,
                }),
                DownloadEventKind::Complete => return Ok(event),
                DownloadEventKind::Interrupted | DownloadEventKind::ConnectionFailed => {
                    return Err(event_error(&event));
                }
            }
        }
    }

    fn finish(&self, descriptor: &ArtifactDescriptor, path: &Path) -> Result<PathBuf> {
        let hasher = FileHasher::new(&descriptor.hash_algorithm, path)?;
        if let Err(e) = hasher.verify(&descriptor.hash) {
            if e.kind() == ErrorKind::VerificationFailed {
                warn!("Hash mismatch for {}, deleting", path.display());
                if let Err(e) = fs::remove_file(path) {
                    warn!("Failed to delete {}: {}", path.display(), e);
                }
            }
            return Err(e);
        }

        if self.keep_artifacts
            && let Some(cache) = &self.cache
            && let Err(e) = cache.store(path, &descriptor.file_name)
        {
            warn!("Could not cache {}: {}", descriptor.file_name, e);
        }

        info!("Download finished: {}", path.display());
        self.emit(ApkEvent::Complete {
            canonical_url: descriptor.canonical_url.clone(),
            path: path.to_path_buf(),
            from_cache: false,
        });
        Ok(path.to_path_buf())
    }
}

/// Rebuild the classified error carried by a failure event
fn event_error(event: &DownloadEvent) -> Error {
    let message = event.message.clone().unwrap_or_default();
    match event.error_kind {
        Some(ErrorKind::NotFound) => Error::NotFound(message),
        Some(ErrorKind::ConnectionFailed) => Error::ConnectionFailed(message),
        Some(ErrorKind::Interrupted) | None => Error::Interrupted,
        Some(ErrorKind::Configuration) => Error::Configuration(message),
        Some(ErrorKind::VerificationFailed) | Some(ErrorKind::Io) => Error::IoError(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256;
    use crate::net::coordinator::tests::GatedMaker;
    use url::Url;

    struct Fixture {
        _dirs: Vec<tempfile::TempDir>,
        src: PathBuf,
        cache: PathBuf,
        coordinator: Arc<DownloadCoordinator>,
        mirrors: Arc<MirrorManager>,
    }

    fn fixture() -> Fixture {
        let src = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let coordinator =
            Arc::new(DownloadCoordinator::new(GatedMaker::open(), downloads.path()).unwrap());
        Fixture {
            src: src.path().to_path_buf(),
            cache: cache.path().to_path_buf(),
            coordinator,
            mirrors: Arc::new(MirrorManager::in_memory()),
            _dirs: vec![src, downloads, cache],
        }
    }

    fn file_url(path: &Path) -> String {
        Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn test_verify_or_delete_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.apk");
        fs::write(&good, b"good").unwrap();
        let digest = sha256(b"good");

        assert!(verify_or_delete(&good, &digest, "sha256").unwrap());
        assert!(verify_or_delete(&good, &digest.to_uppercase(), "sha256").unwrap());
        assert!(good.exists());

        let bad = dir.path().join("bad.apk");
        fs::write(&bad, b"tampered").unwrap();
        assert!(!verify_or_delete(&bad, &digest, "sha256").unwrap());
        assert!(!bad.exists());
        assert!(!verify_or_delete(&bad, &digest, "sha256").unwrap());

        let err = verify_or_delete(&good, &digest, "whirlpool").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_stale_cache_replaced_by_fresh_download() {
        let fx = fixture();
        let body = vec![42u8; 1000];
        fs::write(fx.src.join("app.apk"), &body).unwrap();

        let cache = Arc::new(DirectoryCache::new(&fx.cache));
        fs::write(fx.cache.join("app.apk"), b"corrupted copy").unwrap();

        let apk = ApkDownloader::new(Arc::clone(&fx.coordinator), Arc::clone(&fx.mirrors))
            .with_cache(cache.clone(), true);
        let events = apk.subscribe();
        let descriptor = ArtifactDescriptor::new(1, &file_url(&fx.src.join("app.apk")), &sha256(&body))
            .with_size(1000);

        let path = apk.fetch(&descriptor).unwrap();
        assert_eq!(fs::read(&path).unwrap(), body);
        // Re-cached after verification
        assert_eq!(fs::read(fx.cache.join("app.apk")).unwrap(), body);

        let complete = events
            .try_iter()
            .find(|e| matches!(e, ApkEvent::Complete { .. }))
            .unwrap();
        assert_eq!(
            complete,
            ApkEvent::Complete {
                canonical_url: descriptor.canonical_url.clone(),
                path: path.clone(),
                from_cache: false,
            }
        );
    }

    #[test]
    fn test_valid_cache_skips_network() {
        let fx = fixture();
        let cache = Arc::new(DirectoryCache::new(&fx.cache));
        fs::write(fx.cache.join("app.apk"), b"cached").unwrap();

        let apk = ApkDownloader::new(Arc::clone(&fx.coordinator), Arc::clone(&fx.mirrors))
            .with_cache(cache, false);
        // The source does not exist: any network attempt would fail
        let descriptor =
            ArtifactDescriptor::new(1, &file_url(&fx.src.join("app.apk")), &sha256(b"cached"));

        let path = apk.fetch(&descriptor).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"cached");
    }

    #[test]
    fn test_corrupt_download_is_deleted() {
        let fx = fixture();
        fs::write(fx.src.join("app.apk"), b"evil bytes").unwrap();

        let apk = ApkDownloader::new(Arc::clone(&fx.coordinator), Arc::clone(&fx.mirrors));
        let events = apk.subscribe();
        let descriptor =
            ArtifactDescriptor::new(1, &file_url(&fx.src.join("app.apk")), &sha256(b"good bytes"));

        let err = apk.fetch(&descriptor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerificationFailed);
        assert_eq!(error_code(&err), HASH_MISMATCH);
        assert!(!fx.coordinator.destination(&descriptor.canonical_url).unwrap().exists());
        assert!(events.try_iter().any(|e| matches!(e, ApkEvent::Failed { code: 101, .. })));
    }

    #[test]
    fn test_failover_charges_only_failing_mirror() {
        let fx = fixture();
        let good_dir = fx.src.join("good");
        fs::create_dir_all(&good_dir).unwrap();
        fs::write(good_dir.join("app.apk"), b"payload").unwrap();

        let broken = Mirror::new(file_url(&fx.src.join("broken")));
        let good = Mirror::new(file_url(&good_dir));
        let descriptor = ArtifactDescriptor::new(4, "https://f-droid.org/repo/app.apk", &sha256(b"payload"))
            .with_mirrors(vec![broken.clone(), good.clone()]);

        let apk = ApkDownloader::new(Arc::clone(&fx.coordinator), Arc::clone(&fx.mirrors));
        let events = apk.subscribe();
        let path = apk.fetch(&descriptor).unwrap();

        assert_eq!(fs::read(path).unwrap(), b"payload");
        assert_eq!(fx.mirrors.error_count(&broken), 1);
        assert_eq!(fx.mirrors.error_count(&good), 0);
        assert!(events.try_iter().any(|e| matches!(e, ApkEvent::MirrorFailed { error_count: 1, .. })));
    }

    #[test]
    fn test_repeated_failover_never_stalls() {
        let fx = fixture();
        let good_dir = fx.src.join("good");
        fs::create_dir_all(&good_dir).unwrap();
        fs::write(good_dir.join("app.apk"), b"payload").unwrap();
        let canonical = "https://f-droid.org/repo/app.apk";
        let destination = fx.coordinator.destination(canonical).unwrap();

        for _ in 0..25 {
            let _ = fs::remove_file(&destination);
            let broken = Mirror::new(file_url(&fx.src.join("broken")));
            let good = Mirror::new(file_url(&good_dir));
            let descriptor = ArtifactDescriptor::new(4, canonical, &sha256(b"payload"))
                .with_mirrors(vec![broken, good]);
            let apk = ApkDownloader::new(
                Arc::clone(&fx.coordinator),
                Arc::new(MirrorManager::in_memory()),
            );

            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(apk.fetch(&descriptor).map(|_| ()));
            });
            let outcome = rx
                .recv_timeout(std::time::Duration::from_secs(10))
                .expect("fetch did not return after failing over");
            assert!(outcome.is_ok(), "{outcome:?}");
        }
    }

    #[test]
    fn test_all_mirrors_failing_is_download_failed() {
        let fx = fixture();
        let descriptor = ArtifactDescriptor::new(4, "https://f-droid.org/repo/app.apk", &sha256(b"x"))
            .with_mirrors(vec![
                Mirror::new(file_url(&fx.src.join("a"))),
                Mirror::new(file_url(&fx.src.join("b"))),
            ]);

        let apk = ApkDownloader::new(Arc::clone(&fx.coordinator), Arc::clone(&fx.mirrors));
        let err = apk.fetch(&descriptor).unwrap_err();
        assert!(err.is_failover_candidate());
        assert_eq!(error_code(&err), DOWNLOAD_FAILED);
    }

    #[test]
    fn test_unknown_algorithm_before_io() {
        let fx = fixture();
        let apk = ApkDownloader::new(Arc::clone(&fx.coordinator), Arc::clone(&fx.mirrors));
        let descriptor = ArtifactDescriptor::new(1, "https://f-droid.org/repo/a.apk", "00")
            .with_algorithm("crc32");
        let err = apk.fetch(&descriptor).unwrap_err();
        assert_eq!(error_code(&err), UNKNOWN_ERROR);
    }
}
