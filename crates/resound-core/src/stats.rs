//! Typed statistics snapshots.
//!
//! The broadcaster exposes its state as plain structs so the HTTP layer can
//! serialize them without the engine knowing anything about response formats.
//! Snapshots are point-in-time reads; the fields are gathered without a
//! global lock, so a reader may observe, say, a newer queue count than cache
//! size.

use serde::Serialize;

/// Full broadcaster snapshot served by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub relays: RelayCounts,
    pub queue: QueueStats,
    pub cache: CacheStats,
    /// Current scored selection, best first.
    pub top_relays: Vec<RelayView>,
    /// Operator-configured always-on targets.
    pub mandatory_relays: Vec<RelayView>,
}

/// Pool-level counts.
#[derive(Debug, Clone, Serialize)]
pub struct RelayCounts {
    /// All tracked relays, tested or not.
    pub total_relays: usize,
    /// Relays currently in the scored selection.
    pub active_relays: usize,
    /// Relays configured as mandatory.
    pub mandatory_relays: usize,
}

/// Queue and worker-pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub workers: usize,
    pub channel_size: usize,
    pub channel_capacity: usize,
    pub channel_utilization_pct: f64,
    pub overflow_size: usize,
    pub total_queued: usize,
    /// High-water mark of `total_queued`.
    pub peak_size: usize,
    /// Times the overflow went from empty to non-empty.
    pub saturation_count: u64,
    pub is_saturated: bool,
    /// Unix timestamp of the most recent saturation, if any.
    pub last_saturation: Option<u64>,
}

/// Dedup cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub utilization_pct: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
}

/// Per-endpoint view used in the top and mandatory listings.
#[derive(Debug, Clone, Serialize)]
pub struct RelayView {
    pub url: String,
    pub score: f64,
    pub success_rate: f64,
    pub avg_response_ms: u64,
    pub total_attempts: u64,
}

/// Percentage helper that tolerates a zero denominator.
pub(crate) fn percentage(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64 * 100.0
    }
}
