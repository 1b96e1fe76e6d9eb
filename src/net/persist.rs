// src/net/persist.rs

//! Debounced single-writer persistence
//!
//! The mirror and DNS caches change in bursts (one failure per mirror while
//! failing over, one address per host while a repo updates). Each cache owns
//! a [`Persister`] whose thread waits [`DEBOUNCE`] after the first change and
//! then writes one JSON snapshot, so a burst costs a single write.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Delay between the first unsaved change and the write
pub const DEBOUNCE: Duration = Duration::from_secs(1);

type Snapshot = Arc<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;

enum Command {
    Dirty,
    Flush(flume::Sender<()>),
}

/// Background writer for one state file
pub struct Persister {
    tx: Option<flume::Sender<Command>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    /// Start a writer thread for `path`; `snapshot` serializes the current state
    pub fn spawn(name: &str, path: PathBuf, delay: Duration, snapshot: Snapshot) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("persist-{name}"))
            .spawn(move || run(rx, &path, delay, snapshot))
            .map_err(|e| Error::InitError(format!("Failed to spawn {name} writer: {e}")))?;

        Ok(Self {
            tx: Some(tx),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Note a change; the write happens once the debounce window closes
    pub fn mark_dirty(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Command::Dirty);
        }
    }

    /// Write the current state now and wait for it to land
    pub fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (ack_tx, ack_rx) = flume::bounded(1);
        if tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        // Disconnecting the channel makes the thread write pending state and exit
        self.tx.take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(rx: flume::Receiver<Command>, path: &Path, delay: Duration, snapshot: Snapshot) {
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(when) => match rx.recv_deadline(when) {
                Ok(command) => command,
                Err(flume::RecvTimeoutError::Timeout) => {
                    write_snapshot(path, &snapshot);
                    deadline = None;
                    continue;
                }
                Err(flume::RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Dirty => {
                deadline.get_or_insert_with(|| Instant::now() + delay);
            }
            Command::Flush(ack) => {
                write_snapshot(path, &snapshot);
                deadline = None;
                let _ = ack.send(());
            }
        }
    }

    if deadline.is_some() {
        write_snapshot(path, &snapshot);
    }
    debug!("Writer for {} stopped", path.display());
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) {
    let result = snapshot().and_then(|bytes| write_atomic(path, &bytes));
    match result {
        Ok(()) => debug!("Persisted {}", path.display()),
        Err(e) => warn!("Failed to persist {}: {}", path.display(), e),
    }
}

/// Replace `path` with `bytes` via a temp file in the same directory
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| Error::IoError(format!("Failed to replace {}: {}", path.display(), e.error)))?;
    Ok(())
}
