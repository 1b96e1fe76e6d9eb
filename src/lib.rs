// src/lib.rs

//! fdroid-net
//!
//! Package repository client with verified downloads and a local swap server.
//!
//! # Architecture
//!
//! - Transports: HTTP(S), Tor, local files, document trees and Bluetooth all
//!   implement one `Downloader` contract (streaming, resumable, cancellable)
//! - Coordinator: a single worker thread fed by a deduplicating queue that
//!   publishes lifecycle events to subscribers
//! - Integrity: every artifact is hashed before it is trusted, both when it
//!   comes from the local cache and after a fresh download
//! - Mirrors: failures are counted per mirror and feed the ranking used for
//!   failover
//! - Swap: a sandboxed HTTP(S) web root serving a signed repository index,
//!   advertised over mDNS and reachable over Bluetooth

pub mod bluetooth;
pub mod config;
mod error;
pub mod hash;
pub mod net;
pub mod progress;

#[cfg(feature = "swap")]
pub mod swap;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use hash::{FileHasher, Hash, HashAlgorithm, Hasher};
pub use net::{
    ApkDownloader, ArtifactDescriptor, CancelToken, DownloadCoordinator, DownloadEvent,
    DownloadEventKind, Downloader, DownloaderFactory, MirrorManager,
};
pub use progress::{CallbackProgress, CliProgress, LogProgress, ProgressListener, SilentProgress};
