// src/swap/mod.rs
//! Local swap server
//!
//! Turns this machine into a small repository that nearby devices can pull
//! packages from. [`SwapContext`] owns every piece of swap state, so a
//! process can run several independent contexts (tests do).
//!
//! Startup order:
//! 1. open the keystore (index identity is created on first use)
//! 2. publish the selected apps and sign the index
//! 3. start HTTP(S), falling back to plain HTTP if no TLS identity is available
//! 4. advertise over mDNS and optionally listen on Bluetooth

pub mod bluetooth_server;
pub mod bonjour;
pub mod httpd;
pub mod keystore;
pub mod repo;
pub mod webroot;

pub use bluetooth_server::BluetoothServer;
pub use bonjour::{Advertisement, BonjourManager, BonjourPeer, BonjourStatus};
pub use httpd::{HttpServer, SwapRequest};
pub use keystore::KeyStore;
pub use repo::{IndexV1, LocalRepo, SwapApp, verify_signed_index};
pub use webroot::WebRoot;

use crate::config::SwapConfig;
use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

pub struct SwapContext {
    config: SwapConfig,
    keystore: Arc<KeyStore>,
    repo: LocalRepo,
    requests_tx: flume::Sender<SwapRequest>,
    requests_rx: flume::Receiver<SwapRequest>,
    address: Option<IpAddr>,
    http: Option<HttpServer>,
    bonjour: BonjourManager,
    bluetooth: Option<BluetoothServer>,
}

impl SwapContext {
    /// Open the keystore and prepare the web root; nothing is served yet
    pub fn new(config: SwapConfig) -> Result<Self> {
        let keystore = Arc::new(KeyStore::open(&config.keystore_path)?);
        let repo = LocalRepo::new(&config.web_root)?;
        let (requests_tx, requests_rx) = flume::unbounded();
        Ok(Self {
            config,
            keystore,
            repo,
            requests_tx,
            requests_rx,
            address: None,
            http: None,
            bonjour: BonjourManager::new(),
            bluetooth: None,
        })
    }

    pub fn config(&self) -> &SwapConfig {
        &self.config
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    pub fn repo(&self) -> &LocalRepo {
        &self.repo
    }

    pub fn repo_mut(&mut self) -> &mut LocalRepo {
        &mut self.repo
    }

    pub fn bonjour(&self) -> &BonjourManager {
        &self.bonjour
    }

    /// Swap-back requests posted by peers
    pub fn swap_requests(&self) -> flume::Receiver<SwapRequest> {
        self.requests_rx.clone()
    }

    /// Whether the running server speaks TLS
    pub fn is_https(&self) -> bool {
        self.http.as_ref().is_some_and(HttpServer::is_tls)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(HttpServer::local_addr)
    }

    /// `http(s)://<ip>:<port>/fdroid/repo`
    pub fn repo_address(&self, address: IpAddr, port: u16, https: bool) -> String {
        let scheme = if https { "https" } else { "http" };
        let host = match address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        format!("{scheme}://{host}:{port}{}", repo::REPO_PATH)
    }

    /// Rebuild the whole repository for `apps`
    pub fn publish(&mut self, address: IpAddr, port: u16, https: bool, apps: &[SwapApp]) -> Result<IndexV1> {
        let repo_address = self.repo_address(address, port, https);
        let host = address.to_string();
        self.repo
            .generate(&self.keystore, &repo_address, &self.config.repo_name, &host, apps)
    }

    /// TLS settings bound to `address`, or None to serve plain HTTP
    pub fn tls_config(&self, address: IpAddr) -> Option<Arc<rustls::ServerConfig>> {
        if let Err(e) = self.keystore.set_transport_address(address) {
            warn!("[swap] No transport certificate for {}, serving plain HTTP: {}", address, e);
            return None;
        }
        match self.keystore.server_config() {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("[swap] TLS unavailable, serving plain HTTP: {}", e);
                None
            }
        }
    }

    /// Publish `apps` and start serving them on `bind`
    ///
    /// `address` is the address peers use to reach us; it ends up in the
    /// index, the transport certificate and the mDNS record.
    pub async fn start(&mut self, bind: SocketAddr, address: IpAddr, apps: &[SwapApp]) -> Result<SocketAddr> {
        if self.http.is_some() {
            return Err(Error::InitError("Swap server already running".into()));
        }

        let tls = if self.config.https {
            self.tls_config(address)
        } else {
            None
        };

        let router = httpd::create_router(WebRoot::new(self.repo.web_root()), self.requests_tx.clone());
        let server = HttpServer::start(bind, router, tls).await?;
        let local = server.local_addr();
        let https = server.is_tls();
        self.http = Some(server);
        self.address = Some(address);

        if let Err(e) = self.publish(address, local.port(), https, apps) {
            self.stop().await;
            return Err(e);
        }

        info!(
            "[swap] Repo '{}' ready at {}",
            self.repo.snapshot().name,
            self.repo_address(address, local.port(), https)
        );
        Ok(local)
    }

    /// Announce the running server over mDNS
    pub fn advertise(&mut self) -> Result<()> {
        let (Some(address), Some(local)) = (self.address, self.local_addr()) else {
            return Err(Error::InitError("Swap server is not running".into()));
        };
        let advertisement = Advertisement {
            name: self.repo.snapshot().name.clone(),
            address,
            port: local.port(),
            fingerprint: self.keystore.fingerprint()?,
            https: self.is_https(),
        };
        self.bonjour.start()?;
        self.bonjour.set_visible(advertisement)
    }

    /// Serve the same web root over RFCOMM when a channel is configured
    pub fn start_bluetooth(&mut self) -> Result<bool> {
        let Some(channel) = self.config.bluetooth_channel else {
            return Ok(false);
        };
        if self.bluetooth.is_none() {
            let server = BluetoothServer::start(channel, WebRoot::new(self.repo.web_root()))?;
            self.bluetooth = Some(server);
        }
        Ok(true)
    }

    /// Stop every server; the published files stay on disk
    pub async fn stop(&mut self) {
        if self.bonjour.is_started() {
            self.bonjour.stop();
        }
        if let Some(bluetooth) = self.bluetooth.take() {
            bluetooth.stop();
        }
        if let Some(http) = self.http.take() {
            http.stop().await;
        }
        self.address = None;
        info!("[swap] Stopped");
    }
}
