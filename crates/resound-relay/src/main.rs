//! Resound broadcast relay daemon.
//!
//! Accepts Nostr events over websocket and republishes each one to the
//! best-scoring downstream relays plus the operator's mandatory set. Nothing
//! is stored; subscriptions are answered empty.
//!
//! # Usage
//!
//! ```bash
//! # Run with default seeds and ports
//! resound-relay
//!
//! # Custom seeds and mandatory targets
//! resound-relay \
//!     --seed-relays wss://relay.damus.io,wss://nos.lol \
//!     --mandatory-relays wss://relay.mine.example \
//!     --top-n 30
//! ```
//!
//! Every flag also reads an environment variable (`SEED_RELAYS`,
//! `MANDATORY_RELAYS`, `TOP_N_RELAYS`, ...).
//!
//! # Graceful shutdown
//!
//! SIGINT/SIGTERM stop the ingress, drain the broadcast queue, stop the
//! refresh and reaper loops, and log final statistics before exiting.

mod nip11;
mod server;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use resound_core::url::normalize_relay_url;
use resound_core::{
    metrics::{init_metrics, start_metrics_server},
    BroadcastConfig, Broadcaster, Discovery, HealthChecker, IngressAdapter, RelayPool,
    RelayTransport, WebSocketTransport,
};

use nip11::RelayInformationDocument;
use server::{build_router, AppState};

/// Zero-storage Nostr broadcast relay.
#[derive(Parser, Debug)]
#[command(name = "resound-relay")]
#[command(about = "Broadcasts incoming Nostr events to the healthiest downstream relays")]
#[command(version)]
struct Args {
    /// Seed relays sampled for relay discovery (comma-separated)
    #[arg(long, env = "SEED_RELAYS", value_delimiter = ',')]
    seed_relays: Option<Vec<String>>,

    /// Relays that receive every event regardless of score (comma-separated)
    #[arg(long, env = "MANDATORY_RELAYS", value_delimiter = ',')]
    mandatory_relays: Vec<String>,

    /// Number of top-scored relays to broadcast to
    #[arg(long, env = "TOP_N_RELAYS", default_value = "50")]
    top_n: usize,

    /// Success-rate decay factor applied after initialization
    #[arg(long, env = "SUCCESS_RATE_DECAY", default_value = "0.95")]
    decay: f64,

    /// Broadcast worker count (default: 2x logical CPUs)
    #[arg(long, env = "WORKER_COUNT")]
    workers: Option<usize>,

    /// Dedup cache entry lifetime in seconds
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "300")]
    cache_ttl_secs: u64,

    /// Dedup cache capacity
    #[arg(long, env = "CACHE_MAX_SIZE", default_value = "100000")]
    cache_max_size: usize,

    /// Initial probe timeout in seconds
    #[arg(long, env = "INITIAL_TIMEOUT_SECS", default_value = "5")]
    initial_timeout_secs: u64,

    /// Per-attempt publish timeout in seconds
    #[arg(long, env = "PUBLISH_TIMEOUT_SECS", default_value = "10")]
    publish_timeout_secs: u64,

    /// Discovery refresh period in seconds
    #[arg(long, env = "REFRESH_INTERVAL_SECS", default_value = "86400")]
    refresh_interval_secs: u64,

    /// Websocket/HTTP listen port
    #[arg(long, env = "RELAY_PORT", default_value = "3334")]
    port: u16,

    /// Prometheus metrics port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Relay name shown in the NIP-11 document
    #[arg(long, env = "RELAY_NAME", default_value = "Resound")]
    relay_name: String,

    /// Relay description shown in the NIP-11 document
    #[arg(
        long,
        env = "RELAY_DESCRIPTION",
        default_value = "A Nostr relay that broadcasts events to multiple relays"
    )]
    relay_description: String,

    /// Administrative contact public key (hex)
    #[arg(long, env = "CONTACT_PUBKEY")]
    contact_pubkey: Option<String>,
}

const DEFAULT_SEED_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
    "wss://relay.snort.social",
    "wss://purplepag.es",
    "wss://relay.primal.net",
];

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("info".parse().context("bad directive")?),
        )
        .init();

    let args = Args::parse();

    let seed_relays = args
        .seed_relays
        .clone()
        .unwrap_or_else(|| DEFAULT_SEED_RELAYS.iter().map(|s| s.to_string()).collect());

    let config = BroadcastConfig {
        seed_relays,
        mandatory_relays: args.mandatory_relays.clone(),
        top_n: args.top_n,
        decay: args.decay,
        workers: args.workers.unwrap_or_else(num_workers_default),
        cache_ttl: Duration::from_secs(args.cache_ttl_secs),
        cache_max_size: args.cache_max_size,
        initial_timeout: Duration::from_secs(args.initial_timeout_secs),
        publish_timeout: Duration::from_secs(args.publish_timeout_secs),
        refresh_interval: Duration::from_secs(args.refresh_interval_secs),
        ..Default::default()
    };
    config.validate().context("invalid configuration")?;

    tracing::info!("Resound broadcast relay starting");
    tracing::info!("Configuration:");
    tracing::info!("  Seed relays: {}", config.seed_relays.len());
    tracing::info!("  Mandatory relays: {}", config.mandatory_relays.len());
    tracing::info!("  Top N: {}", config.top_n);
    tracing::info!("  Workers: {}", config.workers);
    tracing::info!("  Cache TTL: {:?}", config.cache_ttl);
    tracing::info!("  Refresh interval: {:?}", config.refresh_interval);
    tracing::info!("  Port: {}", args.port);

    if args.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("failed to start metrics server")?;
    }

    // Wire the engine
    let pool = Arc::new(RelayPool::new(config.top_n, config.decay));
    let transport: Arc<dyn RelayTransport> = Arc::new(WebSocketTransport::new());
    let checker = Arc::new(HealthChecker::new(
        Arc::clone(&pool),
        Arc::clone(&transport),
        config.initial_timeout,
    ));
    let discovery = Arc::new(Discovery::new(
        Arc::clone(&pool),
        Arc::clone(&checker),
        Arc::clone(&transport),
        config.discovery_window,
    ));
    let broadcaster = Arc::new(Broadcaster::new(
        Arc::clone(&pool),
        Arc::clone(&checker),
        Arc::clone(&transport),
        &config,
    ));

    // Mandatory relays must be in the pool before anything probes or
    // publishes, or their health updates would be dropped as unknown
    for url in &config.mandatory_relays {
        match normalize_relay_url(url).ok() {
            Some(normalized) => pool.add_mandatory(&normalized),
            None => tracing::warn!("Ignoring invalid mandatory relay URL: {}", url),
        }
    }

    // Phase 1: initial discovery and probe sweep
    tracing::info!("Phase 1: relay discovery and testing");
    discovery.discover_from_seeds(&config.seed_relays).await;
    pool.mark_initialized();

    // Phase 2: initial selection
    let top = pool.top();
    tracing::info!(
        "Phase 2: selected top {} of {} relays",
        top.len(),
        pool.count()
    );
    for (i, relay) in top.iter().take(10).enumerate() {
        tracing::info!(
            "  {}. {} | success={:.1}% avg={:.0}ms attempts={}",
            i + 1,
            relay.url,
            relay.success_rate * 100.0,
            relay.avg_response_time.as_secs_f64() * 1000.0,
            relay.total_attempts
        );
    }

    Arc::clone(&broadcaster).start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Periodic discovery refresh
    let refresh = {
        let discovery = Arc::clone(&discovery);
        let pool = Arc::clone(&pool);
        let seeds = config.seed_relays.clone();
        let interval = config.refresh_interval;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        tracing::info!("Starting periodic relay refresh");
                        discovery.discover_from_seeds(&seeds).await;
                        tracing::info!(
                            "Refresh complete: {} top relays of {} total",
                            pool.top().len(),
                            pool.count()
                        );
                    }
                }
            }
            tracing::debug!("Periodic refresh stopped");
        })
    };

    // Phase 3: serve
    let state = Arc::new(AppState {
        ingress: IngressAdapter::new(Arc::clone(&discovery), Arc::clone(&broadcaster)),
        broadcaster: Arc::clone(&broadcaster),
        info: RelayInformationDocument::new(
            &args.relay_name,
            &args.relay_description,
            args.contact_pubkey.as_deref(),
        ),
    });
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("Phase 3: relay running on ws://{}", addr);
    tracing::info!("Stats endpoint: http://{}/stats", addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Relay server error: {}", e);
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping gracefully");

    // Stop the ingress first so nothing new is accepted, then drain
    server.abort();
    let _ = shutdown_tx.send(true);
    broadcaster.shutdown().await;
    if let Err(e) = refresh.await {
        if !e.is_cancelled() {
            tracing::warn!("Refresh task ended abnormally: {}", e);
        }
    }

    let stats = broadcaster.stats();
    tracing::info!("Final stats:");
    tracing::info!("  Total relays: {}", stats.relays.total_relays);
    tracing::info!("  Active relays: {}", stats.relays.active_relays);
    tracing::info!("  Peak queue size: {}", stats.queue.peak_size);
    tracing::info!("  Cache hit rate: {:.1}%", stats.cache.hit_rate_pct);
    tracing::info!("Goodbye");

    Ok(())
}

fn num_workers_default() -> usize {
    BroadcastConfig::default().workers
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
