//! Engine configuration.

use std::time::Duration;

use crate::{Error, Result};

/// Configuration for the broadcast engine.
///
/// The daemon fills this from CLI flags and environment variables; tests build
/// it directly. [`BroadcastConfig::validate`] must pass before the engine is
/// constructed.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Seed relay URLs sampled during discovery sweeps.
    pub seed_relays: Vec<String>,
    /// Relays that are always part of the fan-out target set.
    pub mandatory_relays: Vec<String>,
    /// Upper bound on the scored selection size.
    pub top_n: usize,
    /// EWMA factor for success rates after initialization, in (0, 1).
    pub decay: f64,
    /// Number of broadcast worker tasks. Must be at least 1.
    pub workers: usize,
    /// Lifetime of dedup cache entries.
    pub cache_ttl: Duration,
    /// Upper bound on dedup cache entries.
    pub cache_max_size: usize,
    /// Deadline for initial relay probes.
    pub initial_timeout: Duration,
    /// Per-attempt deadline for outbound publishes.
    pub publish_timeout: Duration,
    /// Period of the discovery refresh loop.
    pub refresh_interval: Duration,
    /// Time window for sampling events from a seed relay during discovery.
    pub discovery_window: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            seed_relays: Vec::new(),
            mandatory_relays: Vec::new(),
            top_n: 50,
            decay: 0.95,
            workers: num_cpus::get() * 2,
            cache_ttl: Duration::from_secs(5 * 60),
            cache_max_size: 100_000,
            initial_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            discovery_window: Duration::from_secs(10),
        }
    }
}

impl BroadcastConfig {
    /// Check the configuration for values the engine cannot run with.
    ///
    /// A zero worker count would mean no event is ever dequeued, and a decay
    /// outside (0, 1) would corrupt every success rate it touches, so both are
    /// rejected here rather than detected later.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config(
                "workers must be at least 1; no events would ever be dequeued".into(),
            ));
        }
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(Error::Config(format!(
                "decay must be in (0, 1), got {}",
                self.decay
            )));
        }
        if self.cache_max_size == 0 {
            return Err(Error::Config("cache_max_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Capacity of the bounded broadcast channel.
    pub fn channel_capacity(&self) -> usize {
        self.workers * 10
    }
}
