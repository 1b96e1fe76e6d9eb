// src/net/mirror.rs

//! Mirror ranking and failure bookkeeping
//!
//! Every repository can be served from several mirrors. The manager keeps a
//! process-wide error count per mirror base URL and orders candidates for
//! failover:
//!
//! 1. swap peers on the local network
//! 2. mirrors in the preferred location
//! 3. fewer recorded errors
//! 4. declaration order
//!
//! Onion mirrors only take part while Tor routing is enabled.

use super::factory::{Subnet, is_swap_url};
use super::persist::{DEBOUNCE, Persister};
use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// One place a repository can be fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    pub base_url: String,
    /// ISO 3166 country code, when the repository declares one
    #[serde(default)]
    pub location: Option<String>,
}

impl Mirror {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Key used for error bookkeeping
    pub fn key(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn is_onion(&self) -> bool {
        Url::parse(&self.base_url)
            .map(|u| super::http::is_onion(&u))
            .unwrap_or(false)
    }

    /// Resolve a repository-relative path against this mirror
    pub fn url_for(&self, path: &str) -> Result<Url> {
        let base = format!("{}/", self.key());
        let base = Url::parse(&base)
            .map_err(|e| Error::Configuration(format!("Invalid mirror {}: {e}", self.base_url)))?;
        base.join(path.trim_start_matches('/'))
            .map_err(|e| Error::Configuration(format!("Invalid path {path}: {e}")))
    }
}

/// Shared failure counts plus ranking policy
pub struct MirrorManager {
    errors: Arc<DashMap<String, u32>>,
    preferred_location: Option<String>,
    tor_enabled: bool,
    local_subnet: Option<Subnet>,
    persister: Option<Persister>,
}

impl MirrorManager {
    /// Memory-only manager
    pub fn in_memory() -> Self {
        Self {
            errors: Arc::new(DashMap::new()),
            preferred_location: None,
            tor_enabled: false,
            local_subnet: None,
            persister: None,
        }
    }

    /// Manager configured from `[mirrors]`, loading persisted counts
    pub fn from_config(config: &MirrorConfig, tor_enabled: bool) -> Result<Self> {
        let mut manager = match &config.state_file {
            Some(path) => Self::open(path)?,
            None => Self::in_memory(),
        };
        manager.preferred_location = config.preferred_location.clone();
        manager.tor_enabled = tor_enabled;
        Ok(manager)
    }

    fn open(path: &Path) -> Result<Self> {
        let mut errors = DashMap::new();
        if path.exists() {
            match std::fs::read(path)
                .map_err(Error::from)
                .and_then(|b| Ok(serde_json::from_slice::<BTreeMap<String, u32>>(&b)?))
            {
                Ok(saved) => {
                    debug!("Loaded error counts for {} mirrors", saved.len());
                    errors.extend(saved);
                }
                Err(e) => warn!("Ignoring mirror state {}: {}", path.display(), e),
            }
        }
        let errors = Arc::new(errors);

        let snapshot = Arc::clone(&errors);
        let persister = Persister::spawn(
            "mirrors",
            path.to_path_buf(),
            DEBOUNCE,
            Arc::new(move || {
                let sorted: BTreeMap<String, u32> =
                    snapshot.iter().map(|e| (e.key().clone(), *e.value())).collect();
                Ok(serde_json::to_vec_pretty(&sorted)?)
            }),
        )?;

        Ok(Self {
            persister: Some(persister),
            ..Self::in_memory_with(errors)
        })
    }

    fn in_memory_with(errors: Arc<DashMap<String, u32>>) -> Self {
        Self {
            errors,
            ..Self::in_memory()
        }
    }

    pub fn with_preferred_location(mut self, location: Option<String>) -> Self {
        self.preferred_location = location;
        self
    }

    pub fn with_tor(mut self, enabled: bool) -> Self {
        self.tor_enabled = enabled;
        self
    }

    pub fn with_local_subnet(mut self, subnet: Option<Subnet>) -> Self {
        self.local_subnet = subnet;
        self
    }

    pub fn error_count(&self, mirror: &Mirror) -> u32 {
        self.errors.get(mirror.key()).map(|c| *c).unwrap_or(0)
    }

    /// Count one more failure for `mirror`, returning the new count
    pub fn record_failure(&self, mirror: &Mirror) -> u32 {
        let count = {
            let mut entry = self.errors.entry(mirror.key().to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        info!("Mirror {} failed ({} errors)", mirror.key(), count);
        self.mark_dirty();
        count
    }

    /// Clear the failure count after a good transfer
    pub fn record_success(&self, mirror: &Mirror) {
        if self.errors.remove(mirror.key()).is_some() {
            debug!("Mirror {} recovered", mirror.key());
            self.mark_dirty();
        }
    }

    /// Drop every recorded failure
    pub fn reset(&self) {
        self.errors.clear();
        self.mark_dirty();
    }

    fn is_local(&self, mirror: &Mirror) -> bool {
        Url::parse(&mirror.base_url)
            .map(|u| is_swap_url(&u, self.local_subnet.as_ref()))
            .unwrap_or(false)
    }

    fn in_preferred_location(&self, mirror: &Mirror) -> bool {
        match (&self.preferred_location, &mirror.location) {
            (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
            _ => false,
        }
    }

    /// Eligible mirrors, best first
    pub fn rank(&self, mirrors: &[Mirror]) -> Vec<Mirror> {
        let mut ranked: Vec<(usize, &Mirror)> = mirrors
            .iter()
            .enumerate()
            .filter(|(_, m)| self.tor_enabled || !m.is_onion())
            .collect();

        ranked.sort_by_key(|(index, mirror)| {
            (
                !self.is_local(mirror),
                !self.in_preferred_location(mirror),
                self.error_count(mirror),
                *index,
            )
        });

        ranked.into_iter().map(|(_, m)| m.clone()).collect()
    }

    /// Best eligible mirror not in `tried`
    pub fn next_mirror(&self, mirrors: &[Mirror], tried: &[Mirror]) -> Option<Mirror> {
        self.rank(mirrors).into_iter().find(|m| !tried.contains(m))
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

impl Default for MirrorManager {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirrors() -> Vec<Mirror> {
        vec![
            Mirror::new("https://f-droid.org/repo"),
            Mirror::new("https://ftp.fau.de/fdroid/repo").with_location("DE"),
            Mirror::new("http://fdroidorg6cooksyluodepej4erfctzk7rrjpjbbr6wx24jh3lqyfwyd.onion/fdroid/repo"),
            Mirror::new("https://mirror.example.org/fdroid/repo/"),
        ]
    }

    #[test]
    fn test_failure_counts_are_per_mirror() {
        let manager = MirrorManager::in_memory();
        let list = mirrors();

        assert_eq!(manager.record_failure(&list[0]), 1);
        assert_eq!(manager.error_count(&list[0]), 1);
        assert_eq!(manager.error_count(&list[1]), 0);

        manager.record_success(&list[1]);
        assert_eq!(manager.error_count(&list[0]), 1);

        manager.record_success(&list[0]);
        assert_eq!(manager.error_count(&list[0]), 0);
    }

    #[test]
    fn test_rank_prefers_healthy_then_declared_order() {
        let manager = MirrorManager::in_memory();
        let list = mirrors();
        manager.record_failure(&list[0]);

        let ranked = manager.rank(&list);
        let urls: Vec<&str> = ranked.iter().map(|m| m.key()).collect();
        assert_eq!(
            urls,
            vec![
                "https://ftp.fau.de/fdroid/repo",
                "https://mirror.example.org/fdroid/repo",
                "https://f-droid.org/repo",
            ]
        );
    }

    #[test]
    fn test_rank_location_and_tor() {
        let manager = MirrorManager::in_memory()
            .with_preferred_location(Some("de".into()))
            .with_tor(true);
        let ranked = manager.rank(&mirrors());

        assert_eq!(ranked.len(), 4);
        assert_eq!(ranked[0].location.as_deref(), Some("DE"));
        assert!(ranked.iter().any(|m| m.is_onion()));
    }

    #[test]
    fn test_swap_peer_ranks_first() {
        let subnet: Subnet = "192.168.1.0/24".parse().unwrap();
        let manager = MirrorManager::in_memory().with_local_subnet(Some(subnet));
        let mut list = mirrors();
        list.push(Mirror::new("http://192.168.1.20:8888/fdroid/repo"));

        let ranked = manager.rank(&list);
        assert_eq!(ranked[0].key(), "http://192.168.1.20:8888/fdroid/repo");
    }

    #[test]
    fn test_next_mirror_skips_tried() {
        let manager = MirrorManager::in_memory();
        let list = mirrors();
        let first = manager.next_mirror(&list, &[]).unwrap();
        let second = manager.next_mirror(&list, std::slice::from_ref(&first)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_url_for() {
        let mirror = Mirror::new("https://mirror.example.org/fdroid/repo/");
        assert_eq!(
            mirror.url_for("/org.example.app_3.apk").unwrap().as_str(),
            "https://mirror.example.org/fdroid/repo/org.example.app_3.apk"
        );
    }

    #[test]
    fn test_counts_persist() {
        let dir = tempfile::tempdir().unwrap();
        let config = MirrorConfig {
            state_file: Some(dir.path().join("mirrors.json")),
            preferred_location: None,
        };
        let mirror = Mirror::new("https://f-droid.org/repo");
        {
            let manager = MirrorManager::from_config(&config, false).unwrap();
            manager.record_failure(&mirror);
            manager.record_failure(&mirror);
            manager.flush();
        }

        let manager = MirrorManager::from_config(&config, false).unwrap();
        assert_eq!(manager.error_count(&mirror), 2);
    }
}
