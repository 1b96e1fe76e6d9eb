// src/net/dns.rs

//! Process-wide DNS cache
//!
//! Remembers the addresses repository hosts resolved to, so later requests
//! can skip the system resolver (slow or blocked networks). Entries are fed
//! from the peer address of successful HTTP responses.

use super::persist::{DEBOUNCE, Persister};
use crate::error::Result;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Host name to address list, safe to share between transfers
pub struct DnsCache {
    entries: Arc<DashMap<String, Vec<IpAddr>>>,
    persister: Option<Persister>,
}

impl DnsCache {
    /// Memory-only cache
    pub fn in_memory() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            persister: None,
        }
    }

    /// Cache backed by a JSON file; unreadable state starts empty
    pub fn open(path: &Path) -> Result<Self> {
        let mut entries = DashMap::new();
        if path.exists() {
            match std::fs::read(path)
                .map_err(crate::Error::from)
                .and_then(|b| Ok(serde_json::from_slice::<BTreeMap<String, Vec<IpAddr>>>(&b)?))
            {
                Ok(saved) => {
                    debug!("Loaded {} DNS entries from {}", saved.len(), path.display());
                    entries.extend(saved);
                }
                Err(e) => warn!("Ignoring DNS cache {}: {}", path.display(), e),
            }
        }
        let entries = Arc::new(entries);

        let snapshot_entries = Arc::clone(&entries);
        let persister = Persister::spawn(
            "dns",
            path.to_path_buf(),
            DEBOUNCE,
            Arc::new(move || {
                let sorted: BTreeMap<String, Vec<IpAddr>> = snapshot_entries
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();
                Ok(serde_json::to_vec_pretty(&sorted)?)
            }),
        )?;

        Ok(Self {
            entries,
            persister: Some(persister),
        })
    }

    /// Cached addresses for `host`, with port 0 (the URL's port wins)
    pub fn lookup(&self, host: &str) -> Option<Vec<SocketAddr>> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .filter(|addrs| !addrs.is_empty())
            .map(|addrs| addrs.iter().map(|ip| SocketAddr::new(*ip, 0)).collect())
    }

    pub fn insert(&self, host: &str, addrs: Vec<IpAddr>) {
        // Literal addresses need no caching
        if host.parse::<IpAddr>().is_ok() || addrs.is_empty() {
            return;
        }
        let key = host.to_ascii_lowercase();
        let changed = self.entries.get(&key).is_none_or(|old| *old != addrs);
        if changed {
            self.entries.insert(key, addrs);
            self.mark_dirty();
        }
    }

    /// Forget a host, e.g. after its cached address stopped answering
    pub fn remove(&self, host: &str) {
        if self.entries.remove(&host.to_ascii_lowercase()).is_some() {
            self.mark_dirty();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&self) {
        if let Some(p) = &self.persister {
            p.flush();
        }
    }

    fn mark_dirty(&self) {
        if let Some(p) = &self.persister {
            p.mark_dirty();
        }
    }
}

impl std::fmt::Debug for DnsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsCache")
            .field("entries", &self.entries.len())
            .field("persistent", &self.persister.is_some())
            .finish()
    }
}
