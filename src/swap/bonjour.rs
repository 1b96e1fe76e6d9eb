// src/swap/bonjour.rs
//! mDNS advertisement and discovery of swap repositories
//!
//! A swap repository is announced as a plain web service (`_http._tcp` or
//! `_https._tcp`) whose TXT record marks it as a repository:
//! - `path`: repository path on the server, always `/fdroid/repo`
//! - `name`: human readable repository name
//! - `fingerprint`: SHA-256 of the index signing certificate
//! - `type`: `fdroidrepo` for HTTP, `fdroidrepos` for HTTPS
//!
//! Browsing ignores any web service whose `type` is not one of those two.

use super::repo::REPO_PATH;
use crate::error::{Error, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const HTTP_SERVICE_TYPE: &str = "_http._tcp.local.";
pub const HTTPS_SERVICE_TYPE: &str = "_https._tcp.local.";

pub const TXT_PATH: &str = "path";
pub const TXT_NAME: &str = "name";
pub const TXT_FINGERPRINT: &str = "fingerprint";
pub const TXT_TYPE: &str = "type";

pub const REPO_TYPE: &str = "fdroidrepo";
pub const REPO_TYPE_TLS: &str = "fdroidrepos";

/// Lifecycle of the advertisement, delivered to every subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BonjourStatus {
    Starting,
    Started,
    Visible,
    NotVisible,
    Stopping,
    Stopped,
    Error(String),
}

/// What this device announces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub fingerprint: String,
    pub https: bool,
}

impl Advertisement {
    pub fn service_type(&self) -> &'static str {
        if self.https {
            HTTPS_SERVICE_TYPE
        } else {
            HTTP_SERVICE_TYPE
        }
    }

    pub fn properties(&self) -> HashMap<String, String> {
        let repo_type = if self.https { REPO_TYPE_TLS } else { REPO_TYPE };
        HashMap::from([
            (TXT_PATH.to_string(), REPO_PATH.to_string()),
            (TXT_NAME.to_string(), self.name.clone()),
            (TXT_FINGERPRINT.to_string(), self.fingerprint.clone()),
            (TXT_TYPE.to_string(), repo_type.to_string()),
        ])
    }

    fn service_info(&self) -> Result<ServiceInfo> {
        let host = format!(
            "{}.local.",
            local_hostname().unwrap_or_else(|| "fdroid-net".to_string())
        );
        ServiceInfo::new(
            self.service_type(),
            &self.name,
            &host,
            &[self.address.to_string()][..],
            self.port,
            self.properties(),
        )
        .map_err(|e| Error::InitError(format!("Failed to create service info: {e}")))
    }
}

// =============================================================================
// Advertisement
// =============================================================================

struct Registration {
    advertisement: Advertisement,
    fullname: String,
}

/// Owns the mDNS daemon while swap is running
pub struct BonjourManager {
    daemon: Option<ServiceDaemon>,
    registration: Option<Registration>,
    subscribers: Mutex<Vec<flume::Sender<BonjourStatus>>>,
}

impl Default for BonjourManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BonjourManager {
    pub fn new() -> Self {
        Self {
            daemon: None,
            registration: None,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<BonjourStatus> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, status: BonjourStatus) {
        debug!("[mdns] Status {:?}", status);
        self.subscribers
            .lock()
            .retain(|tx| tx.send(status.clone()).is_ok());
    }

    pub fn is_started(&self) -> bool {
        self.daemon.is_some()
    }

    pub fn advertisement(&self) -> Option<&Advertisement> {
        self.registration.as_ref().map(|r| &r.advertisement)
    }

    /// Start the daemon; `Started` may be reported more than once per session
    pub fn start(&mut self) -> Result<()> {
        if self.daemon.is_some() {
            self.emit(BonjourStatus::Started);
            return Ok(());
        }
        self.emit(BonjourStatus::Starting);
        match ServiceDaemon::new() {
            Ok(daemon) => {
                self.daemon = Some(daemon);
                info!("[mdns] Daemon started");
                self.emit(BonjourStatus::Started);
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to create mDNS daemon: {e}");
                self.emit(BonjourStatus::Error(message.clone()));
                Err(Error::InitError(message))
            }
        }
    }

    /// Announce `advertisement`, replacing the previous one only if it changed
    pub fn set_visible(&mut self, advertisement: Advertisement) -> Result<()> {
        let Some(daemon) = self.daemon.as_ref() else {
            return Err(Error::InitError("mDNS daemon is not running".into()));
        };

        if self
            .registration
            .as_ref()
            .is_none_or(|r| r.advertisement != advertisement)
        {
            let registered = advertisement.service_info().and_then(|service| {
                let fullname = service.get_fullname().to_string();
                if let Some(old) = self.registration.take()
                    && let Err(e) = daemon.unregister(&old.fullname)
                {
                    debug!("[mdns] Error unregistering {}: {}", old.fullname, e);
                }
                daemon
                    .register(service)
                    .map_err(|e| Error::InitError(format!("Failed to register mDNS service: {e}")))?;
                Ok(fullname)
            });

            match registered {
                Ok(fullname) => {
                    info!(
                        "[mdns] Registered {} ({}:{}) type={}",
                        advertisement.name,
                        advertisement.address,
                        advertisement.port,
                        advertisement.service_type()
                    );
                    self.registration = Some(Registration {
                        advertisement,
                        fullname,
                    });
                }
                Err(e) => {
                    self.emit(BonjourStatus::Error(e.to_string()));
                    return Err(e);
                }
            }
        }

        self.emit(BonjourStatus::Visible);
        Ok(())
    }

    pub fn set_not_visible(&mut self) {
        self.unregister();
        self.emit(BonjourStatus::NotVisible);
    }

    /// Withdraw the advertisement and stop the daemon; `Stopped` may repeat
    pub fn stop(&mut self) {
        let Some(daemon) = self.daemon.take() else {
            self.emit(BonjourStatus::Stopped);
            return;
        };
        self.emit(BonjourStatus::Stopping);
        if let Some(old) = self.registration.take()
            && let Err(e) = daemon.unregister(&old.fullname)
        {
            debug!("[mdns] Error unregistering {}: {}", old.fullname, e);
        }
        if let Err(e) = daemon.shutdown() {
            warn!("[mdns] Error during shutdown: {}", e);
        }
        info!("[mdns] Daemon stopped");
        self.emit(BonjourStatus::Stopped);
    }

    fn unregister(&mut self) {
        if let (Some(daemon), Some(old)) = (self.daemon.as_ref(), self.registration.take()) {
            match daemon.unregister(&old.fullname) {
                Ok(_) => info!("[mdns] Unregistered {}", old.fullname),
                Err(e) => debug!("[mdns] Error unregistering {}: {}", old.fullname, e),
            }
        }
    }
}

impl Drop for BonjourManager {
    fn drop(&mut self) {
        if self.daemon.is_some() {
            self.stop();
        }
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// A swap repository found on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BonjourPeer {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub path: String,
    pub fingerprint: Option<String>,
    pub https: bool,
}

impl BonjourPeer {
    /// Build a peer from a resolved service; None for non-repository services
    pub fn from_service(
        name: &str,
        addresses: Vec<IpAddr>,
        port: u16,
        properties: &HashMap<String, String>,
    ) -> Option<Self> {
        let https = match properties.get(TXT_TYPE).map(String::as_str) {
            Some(REPO_TYPE) => false,
            Some(REPO_TYPE_TLS) => true,
            _ => return None,
        };
        Some(Self {
            name: properties
                .get(TXT_NAME)
                .cloned()
                .unwrap_or_else(|| name.to_string()),
            addresses,
            port,
            path: properties
                .get(TXT_PATH)
                .cloned()
                .unwrap_or_else(|| REPO_PATH.to_string()),
            fingerprint: properties.get(TXT_FINGERPRINT).cloned(),
            https,
        })
    }

    /// Repository address, preferring IPv4
    pub fn repo_url(&self) -> Option<String> {
        let address = self
            .addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| self.addresses.first())?;
        let scheme = if self.https { "https" } else { "http" };
        let host = match address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        Some(format!("{scheme}://{host}:{}{}", self.port, self.path))
    }
}

/// Browse both service types for `duration` and collect repositories
pub fn scan(duration: Duration) -> Result<Vec<BonjourPeer>> {
    let daemon = ServiceDaemon::new()
        .map_err(|e| Error::InitError(format!("Failed to create mDNS daemon: {e}")))?;

    let mut receivers = Vec::new();
    for service_type in [HTTP_SERVICE_TYPE, HTTPS_SERVICE_TYPE] {
        let receiver = daemon
            .browse(service_type)
            .map_err(|e| Error::InitError(format!("Failed to start mDNS browse: {e}")))?;
        receivers.push(receiver);
    }
    info!("[mdns] Scanning for swap repositories");

    let mut peers: Vec<BonjourPeer> = Vec::new();
    let start = Instant::now();
    while start.elapsed() < duration {
        for receiver in &receivers {
            while let Ok(event) = receiver.try_recv() {
                if let ServiceEvent::ServiceResolved(service) = event
                    && let Some(peer) = resolve_peer(&service)
                    && !peers.iter().any(|p| p.name == peer.name && p.port == peer.port)
                {
                    info!("[mdns] Found {} at {:?}", peer.name, peer.repo_url());
                    peers.push(peer);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    for service_type in [HTTP_SERVICE_TYPE, HTTPS_SERVICE_TYPE] {
        let _ = daemon.stop_browse(service_type);
    }
    if let Err(e) = daemon.shutdown() {
        debug!("[mdns] Error during shutdown: {}", e);
    }

    info!("[mdns] Scan complete: found {} repositories", peers.len());
    Ok(peers)
}

fn resolve_peer(service: &ServiceInfo) -> Option<BonjourPeer> {
    let properties: HashMap<String, String> = service
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();
    let instance = service
        .get_fullname()
        .split('.')
        .next()
        .unwrap_or("unknown");
    let peer = BonjourPeer::from_service(
        instance,
        service.get_addresses().iter().copied().collect(),
        service.get_port(),
        &properties,
    );
    if peer.is_none() {
        debug!("[mdns] Ignoring {}", service.get_fullname());
    }
    peer
}

fn local_hostname() -> Option<String> {
    #[cfg(unix)]
    {
        use std::ffi::CStr;
        let mut buf = [0u8; 256];
        // SAFETY: buf outlives the call and gethostname NUL-terminates on success
        unsafe {
            if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0
                && let Ok(name) = CStr::from_ptr(buf.as_ptr() as *const libc::c_char).to_str()
            {
                return Some(name.split('.').next().unwrap_or(name).to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(https: bool) -> Advertisement {
        Advertisement {
            name: "Pixel on 192.168.1.5".into(),
            address: "192.168.1.5".parse().unwrap(),
            port: 8888,
            fingerprint: "ab12".into(),
            https,
        }
    }

    #[test]
    fn test_advertisement_txt_record() {
        let plain = advertisement(false);
        assert_eq!(plain.service_type(), HTTP_SERVICE_TYPE);
        let props = plain.properties();
        assert_eq!(props[TXT_PATH], "/fdroid/repo");
        assert_eq!(props[TXT_NAME], "Pixel on 192.168.1.5");
        assert_eq!(props[TXT_FINGERPRINT], "ab12");
        assert_eq!(props[TXT_TYPE], "fdroidrepo");

        let tls = advertisement(true);
        assert_eq!(tls.service_type(), HTTPS_SERVICE_TYPE);
        assert_eq!(tls.properties()[TXT_TYPE], "fdroidrepos");
        assert_ne!(plain, tls);
    }

    #[test]
    fn test_service_info_carries_properties() {
        let info = advertisement(true).service_info().unwrap();
        assert!(info.get_fullname().starts_with("Pixel on 192.168.1.5"));
        assert_eq!(info.get_port(), 8888);
        assert_eq!(info.get_property_val_str(TXT_TYPE), Some("fdroidrepos"));
    }

    #[test]
    fn test_peer_from_service() {
        let props = advertisement(true).properties();
        let peer = BonjourPeer::from_service(
            "instance",
            vec!["fe80::1".parse().unwrap(), "192.168.1.5".parse().unwrap()],
            8888,
            &props,
        )
        .unwrap();
        assert!(peer.https);
        assert_eq!(peer.name, "Pixel on 192.168.1.5");
        assert_eq!(peer.fingerprint.as_deref(), Some("ab12"));
        assert_eq!(
            peer.repo_url().as_deref(),
            Some("https://192.168.1.5:8888/fdroid/repo")
        );
    }

    #[test]
    fn test_plain_web_service_ignored() {
        let props = HashMap::from([(TXT_PATH.to_string(), "/".to_string())]);
        assert!(BonjourPeer::from_service("printer", vec![], 80, &props).is_none());
    }

    #[test]
    fn test_visible_requires_start_and_stop_is_repeatable() {
        let mut manager = BonjourManager::new();
        let status = manager.subscribe();

        assert!(manager.set_visible(advertisement(false)).is_err());
        manager.stop();
        manager.stop();

        let seen: Vec<_> = status.try_iter().collect();
        assert_eq!(seen, vec![BonjourStatus::Stopped, BonjourStatus::Stopped]);
        assert!(!manager.is_started());
        assert!(manager.advertisement().is_none());
    }
}
