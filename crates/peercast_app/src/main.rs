//! peercast daemon: announces this node on the LAN and logs discovered peers.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use peercast_core::AppPaths;
use peercast_core::logging::init_logging;
use peercast_net::{
    CompressionType, DiscoveryConfig, DiscoveryService, ErrorReport, NetworkErrorMiddleware,
    NodeIdentity, Payload, PeerMetadata,
};

#[derive(Debug, Parser)]
#[command(name = "peercast", version, about = "LAN peer discovery daemon")]
struct Args {
    /// UDP port to listen and announce on.
    #[arg(long)]
    port: Option<u16>,

    /// Destination address for announcements.
    #[arg(long)]
    broadcast_addr: Option<IpAddr>,

    /// Milliseconds between announcements.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Payload codec: none, zlib or lz4.
    #[arg(long)]
    compression: Option<CompressionType>,

    /// Node name stored with a newly generated identity.
    #[arg(long)]
    name: Option<String>,

    /// Config file path (default: ~/.peercast/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directives, overridden by RUST_LOG.
    #[arg(long)]
    log_filter: Option<String>,

    /// Seconds between status lines.
    #[arg(long, default_value_t = 30)]
    status_interval_secs: u64,
}

impl Args {
    /// Command-line flags win over file and environment settings.
    fn apply(&self, config: &mut DiscoveryConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = self.broadcast_addr {
            config.broadcast_addr = addr;
        }
        if let Some(ms) = self.interval_ms {
            config.announce_interval = Duration::from_millis(ms);
        }
        if let Some(compression) = self.compression {
            config.compression = compression;
        }
    }

    fn node_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "peercast".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let paths = AppPaths::from_env()?;
    paths.ensure_dirs()?;
    let _guard = init_logging(&paths.logs_dir(), args.log_filter.as_deref())?;

    let config_path = args.config.clone().unwrap_or_else(|| paths.config_path());
    let mut config = DiscoveryConfig::load_or_default(&config_path);
    config.apply_env_overrides();
    args.apply(&mut config);

    let identity = NodeIdentity::load_or_generate(&paths.identity_path(), args.node_name());
    info!(
        "peercast {} starting as '{}' ({})",
        identity.version, identity.name, identity.peer_id
    );

    let middleware = Arc::new(NetworkErrorMiddleware::new());
    let mut service = DiscoveryService::new(identity.peer_id.clone(), config);

    let recorder = Arc::clone(&middleware);
    service.on_peer_discovered(move |id, meta| {
        info!("New peer {id} at {}:{}", meta.address, meta.port);
        recorder.capture_state(id, &peer_state(meta));
    });

    start_with_recovery(&mut service, &middleware, &identity).await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = status.tick() => {
                let stats = service.announce_stats();
                info!(
                    "{} peers known, {} announcements sent, {} failed, compression ratio {:.2}",
                    service.peer_count(),
                    stats.sent,
                    stats.failed,
                    service.compression_ratio()
                );
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Signal handling failed: {e}");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    service.stop().await;
    Ok(())
}

/// Start discovery, retrying while the error middleware allows it.
async fn start_with_recovery(
    service: &mut DiscoveryService,
    middleware: &NetworkErrorMiddleware,
    identity: &NodeIdentity,
) -> Result<()> {
    loop {
        let err = match service.start().await {
            Ok(()) => {
                middleware.mark_recovered(&identity.peer_id);
                return Ok(());
            }
            Err(e) => e,
        };

        let mut report = ErrorReport::from_error("discovery_start", identity.peer_id.clone(), &err);
        if !middleware.handle_error(&mut report) {
            return Err(err).context("Failed to start discovery");
        }

        let wait = report
            .data
            .get("retry_after_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(1000);
        warn!("Discovery start failed, retrying in {wait} ms: {err}");
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }
}

/// Recovery state remembered for a newly discovered peer.
fn peer_state(meta: &PeerMetadata) -> Payload {
    let mut state = Payload::new();
    state.insert("address".into(), serde_json::json!(meta.address));
    state.insert("port".into(), serde_json::json!(meta.port));
    state.insert(
        "discovered_at".into(),
        serde_json::json!(chrono::Utc::now().to_rfc3339()),
    );
    state
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
