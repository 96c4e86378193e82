//! Prometheus metrics helpers.
//!
//! Centralized recorder initialization and metric descriptions for the
//! broadcast engine. Components record through the `metrics` macros; the
//! daemon calls [`init_metrics`] once and serves the `/metrics` endpoint via
//! [`start_metrics_server`].

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_metrics();
    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already
/// installed instead of panicking. Useful in tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Serve the `/metrics` endpoint on the given port in a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn register_metrics() {
    describe_counter!("events_ingested_total", "Events accepted by the ingress");
    describe_counter!(
        "broadcast_publish_total",
        "Publish attempts across all fan-outs"
    );
    describe_counter!(
        "broadcast_publish_failures_total",
        "Publish attempts that failed or timed out"
    );
    describe_counter!(
        "broadcast_overflow_total",
        "Events diverted to the overflow list"
    );
    describe_counter!(
        "broadcast_no_targets_total",
        "Events dropped because the target set was empty"
    );
    describe_gauge!("broadcast_queue_depth", "Events waiting across channel and overflow");

    describe_counter!("dedup_hits_total", "Dedup cache hits (duplicate events)");
    describe_counter!("dedup_misses_total", "Dedup cache misses");
    describe_counter!(
        "dedup_evictions_total",
        "Entries evicted by capacity pressure"
    );
    describe_gauge!("dedup_cache_size", "Entries currently in the dedup cache");

    describe_counter!("relays_discovered_total", "Relays admitted into the pool");
    describe_counter!("probes_total", "Relay probes attempted");
    describe_counter!("probe_failures_total", "Relay probes that failed");
}
