// src/main.rs

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fdroid_net::config::Config;
use fdroid_net::hash::{HashAlgorithm, hash_file};
use fdroid_net::net::apk::{ApkDownloader, ArtifactDescriptor, DirectoryCache};
use fdroid_net::net::coordinator::{DownloadCoordinator, DownloadEventKind, DownloadRequest};
use fdroid_net::net::dns::DnsCache;
use fdroid_net::net::{DownloaderFactory, Mirror, MirrorManager};
use fdroid_net::progress::{CliProgress, ProgressListener};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fdroid-net")]
#[command(author, version, about = "Verified repository downloads and local app swapping", long_about = None)]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(long, global = true, default_value = "/etc/fdroid-net/config.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file through the transfer queue and verify it
    Fetch {
        /// Canonical URL of the file
        url: String,
        /// Expected digest (hex); without it the computed digest is printed
        #[arg(long, alias = "hash")]
        sha256: Option<String>,
        /// Digest algorithm of --sha256
        #[arg(long, default_value = "sha256")]
        algorithm: String,
        /// Directory to download into (default: configured cache dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Mirror base URL to fail over to (repeatable)
        #[arg(long = "mirror")]
        mirrors: Vec<String>,
    },
    /// Print the digest of a local file
    Hash {
        file: PathBuf,
        #[arg(long, default_value = "sha256")]
        algorithm: String,
    },
    /// Serve selected packages as a signed swap repository
    #[cfg(feature = "swap")]
    Serve {
        /// Directory holding the generated repository
        #[arg(long)]
        web_root: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        /// Serve over TLS with the keystore's transport certificate
        #[arg(long)]
        https: bool,
        /// Repository name shown to peers
        #[arg(long)]
        name: Option<String>,
        /// Address peers should use (default: the outbound interface address)
        #[arg(long)]
        address: Option<IpAddr>,
        /// Package to offer, as <package>=<path to apk> (repeatable)
        #[arg(long = "apk")]
        apks: Vec<String>,
    },
    /// List swap repositories announced on the local network
    #[cfg(feature = "swap")]
    Discover {
        #[arg(long, default_value = "5")]
        seconds: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();

    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Fetch {
            url,
            sha256,
            algorithm,
            output,
            mirrors,
        } => cmd_fetch(&config, &url, sha256.as_deref(), &algorithm, output, &mirrors),
        Commands::Hash { file, algorithm } => cmd_hash(&file, &algorithm),
        #[cfg(feature = "swap")]
        Commands::Serve {
            web_root,
            port,
            https,
            name,
            address,
            apks,
        } => {
            let mut swap = config.swap.clone();
            if let Some(web_root) = web_root {
                swap.web_root = web_root;
            }
            if let Some(port) = port {
                swap.port = port;
            }
            if let Some(name) = name {
                swap.repo_name = name;
            }
            swap.https |= https;
            cmd_serve(swap, address, &apks)
        }
        #[cfg(feature = "swap")]
        Commands::Discover { seconds } => cmd_discover(Duration::from_secs(seconds)),
    }
}

fn cmd_hash(file: &Path, algorithm: &str) -> Result<()> {
    let algorithm: HashAlgorithm = algorithm.parse()?;
    let hash = hash_file(algorithm, file).with_context(|| format!("Failed to read {}", file.display()))?;
    println!("{}  {}", hash.as_str(), file.display());
    Ok(())
}

fn cmd_fetch(
    config: &Config,
    url: &str,
    expected: Option<&str>,
    algorithm: &str,
    output: Option<PathBuf>,
    mirrors: &[String],
) -> Result<()> {
    let mut factory = DownloaderFactory::from_config(config)?;
    if config.dns.enabled {
        let dns = match &config.dns.state_file {
            Some(path) => DnsCache::open(path)?,
            None => DnsCache::in_memory(),
        };
        factory = factory.with_dns(Arc::new(dns));
    }

    let cache_dir = output.unwrap_or_else(|| config.download.cache_dir.clone());
    let coordinator = Arc::new(DownloadCoordinator::new(Arc::new(factory), &cache_dir)?);

    let progress = Arc::new(CliProgress::new(url.rsplit('/').next().unwrap_or(url).to_string()));
    let events = coordinator.subscribe();
    let bar = Arc::clone(&progress);
    std::thread::spawn(move || {
        for event in events.iter() {
            if event.kind == DownloadEventKind::Progress {
                bar.on_progress(&event.canonical_url, event.bytes_read, event.total_bytes);
            }
        }
    });

    let result = match expected {
        Some(hash) => fetch_verified(config, &coordinator, url, hash, algorithm, mirrors),
        None => fetch_unverified(&coordinator, url),
    };
    coordinator.shutdown();

    match result {
        Ok(path) => {
            progress.finish_with_message("done");
            let algorithm: HashAlgorithm = algorithm.parse()?;
            let hash = hash_file(algorithm, &path)?;
            println!("{}  {}", hash.as_str(), path.display());
            Ok(())
        }
        Err(e) => {
            progress.abandon_with_message("failed");
            Err(e)
        }
    }
}

fn fetch_verified(
    config: &Config,
    coordinator: &Arc<DownloadCoordinator>,
    url: &str,
    hash: &str,
    algorithm: &str,
    mirrors: &[String],
) -> Result<PathBuf> {
    let manager = Arc::new(MirrorManager::from_config(&config.mirrors, config.tor.enabled)?);
    let cache = Arc::new(DirectoryCache::new(&config.cache.dir));
    let downloader = ApkDownloader::new(Arc::clone(coordinator), Arc::clone(&manager))
        .with_cache(cache, config.cache.keep_artifacts);

    let mut descriptor = ArtifactDescriptor::new(0, url, hash).with_algorithm(algorithm);
    if !mirrors.is_empty() {
        let mut all = vec![Mirror::new(url.rsplit_once('/').map_or(url, |(base, _)| base))];
        all.extend(mirrors.iter().map(|m| Mirror::new(m.as_str())));
        descriptor = descriptor.with_mirrors(all);
    }

    let path = downloader
        .fetch(&descriptor)
        .with_context(|| format!("Failed to fetch {url}"))?;
    manager.flush();
    Ok(path)
}

fn fetch_unverified(coordinator: &DownloadCoordinator, url: &str) -> Result<PathBuf> {
    let events = coordinator.subscribe();
    coordinator.enqueue_request(DownloadRequest::new(0, url));
    for event in events.iter() {
        if event.canonical_url != url || !event.kind.is_terminal() {
            continue;
        }
        if event.kind == DownloadEventKind::Complete {
            return Ok(event.path);
        }
        bail!(
            "Download of {} failed: {}",
            url,
            event.message.unwrap_or_else(|| "unknown error".into())
        );
    }
    bail!("Transfer queue stopped before {url} finished")
}

#[cfg(feature = "swap")]
fn cmd_serve(config: fdroid_net::config::SwapConfig, address: Option<IpAddr>, apks: &[String]) -> Result<()> {
    use fdroid_net::swap::{SwapApp, SwapContext};
    use std::net::{Ipv4Addr, SocketAddr};

    let apps = apks
        .iter()
        .map(|spec| {
            let (package, path) = spec
                .split_once('=')
                .with_context(|| format!("Expected <package>=<path>, got '{spec}'"))?;
            Ok(SwapApp::new(package, path))
        })
        .collect::<Result<Vec<_>>>()?;

    let address = match address {
        Some(address) => address,
        None => local_address().context("Cannot determine a local address, pass --address")?,
    };
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut context = SwapContext::new(config)?;
        let requests = context.swap_requests();
        let local = context.start(bind, address, &apps).await?;

        if let Err(e) = context.advertise() {
            warn!("[mdns] Not advertising: {}", e);
        }
        match context.start_bluetooth() {
            Ok(true) => info!("[bluetooth] Swap repo reachable over Bluetooth"),
            Ok(false) => {}
            Err(e) => warn!("[bluetooth] Not serving: {}", e),
        }

        let scheme = if context.is_https() { "https" } else { "http" };
        println!("Serving {scheme}://{address}:{}/fdroid/repo", local.port());
        println!("Fingerprint: {}", context.keystore().fingerprint()?);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                Ok(request) = requests.recv_async() => {
                    println!("Peer asks to swap back: {}", request.repo);
                }
            }
        }

        context.stop().await;
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(feature = "swap")]
fn cmd_discover(duration: Duration) -> Result<()> {
    let peers = fdroid_net::swap::bonjour::scan(duration)?;
    if peers.is_empty() {
        println!("No swap repositories found");
        return Ok(());
    }
    for peer in peers {
        println!(
            "{}\t{}\t{}",
            peer.name,
            peer.repo_url().unwrap_or_else(|| "-".into()),
            peer.fingerprint.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Address of the interface that routes outbound traffic
#[cfg(feature = "swap")]
fn local_address() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
