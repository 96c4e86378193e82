//! Scored relay pool.
//!
//! The [`RelayPool`] tracks every downstream relay the system knows about,
//! together with the health statistics that feed the composite score used for
//! top-N selection. Endpoint records are created on first sighting (discovery
//! or mandatory configuration) and only removed by explicit administrative
//! action.
//!
//! # Scoring
//!
//! `score = success_rate · 100 − avg_response_secs · 10`, with scores halved
//! for endpoints that have fewer than 3 attempts while the pool is still in
//! its initialization phase. During initialization the success rate is the
//! simple ratio of successes to attempts; after [`RelayPool::mark_initialized`]
//! it follows exponential decay so recent behavior dominates.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Weight applied to the success rate in the composite score.
const SUCCESS_RATE_WEIGHT: f64 = 100.0;

/// Penalty per second of average response time.
const RESPONSE_TIME_PENALTY: f64 = 10.0;

/// Attempts below this threshold halve the score during initialization.
const MIN_ATTEMPTS_FULL_SCORE: u64 = 3;

/// EWMA weights for average response time (prior, new sample).
const RESPONSE_TIME_EWMA: (f64, f64) = (0.7, 0.3);

/// Health record for a single downstream relay.
///
/// Values handed out by the pool are snapshots; mutating a clone has no
/// effect on the tracked state.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    /// Canonical relay URL, the unique key in the pool.
    pub url: String,
    /// Exponentially weighted moving average of successful publish latency.
    pub avg_response_time: Duration,
    /// Success rate in [0, 1].
    pub success_rate: f64,
    /// Total publish/probe attempts.
    pub total_attempts: u64,
    /// Successful publish/probe attempts.
    pub successful_attempts: u64,
    /// Wall-clock time of the most recent outcome.
    pub last_checked: SystemTime,
    /// Mandatory endpoints are always broadcast targets regardless of score.
    pub mandatory: bool,
}

impl RelayEndpoint {
    fn new(url: String, mandatory: bool) -> Self {
        Self {
            url,
            avg_response_time: Duration::ZERO,
            success_rate: 1.0, // start optimistic
            total_attempts: 0,
            successful_attempts: 0,
            last_checked: SystemTime::now(),
            mandatory,
        }
    }

    /// True if this endpoint has never been probed or published to.
    pub fn is_untested(&self) -> bool {
        self.total_attempts == 0
    }
}

struct PoolState {
    relays: HashMap<String, RelayEndpoint>,
    initialized: bool,
}

/// Registry of all known relay endpoints with composite-score ranking.
pub struct RelayPool {
    state: RwLock<PoolState>,
    top_n: usize,
    decay: f64,
}

impl RelayPool {
    /// Create an empty pool in the initialization phase.
    pub fn new(top_n: usize, decay: f64) -> Self {
        debug!("Initializing relay pool: top_n={}, decay={:.2}", top_n, decay);
        Self {
            state: RwLock::new(PoolState {
                relays: HashMap::new(),
                initialized: false,
            }),
            top_n,
            decay,
        }
    }

    /// Add a relay if it is not already tracked. Idempotent.
    pub fn add(&self, url: &str) {
        self.insert(url, false);
    }

    /// Add a mandatory relay. Mandatory endpoints stay in every fan-out
    /// target set even while untested.
    ///
    /// A previously known endpoint is promoted to mandatory without losing
    /// its statistics.
    pub fn add_mandatory(&self, url: &str) {
        let mut state = self.state.write();
        match state.relays.get_mut(url) {
            Some(endpoint) => endpoint.mandatory = true,
            None => {
                state
                    .relays
                    .insert(url.to_string(), RelayEndpoint::new(url.to_string(), true));
                debug!("Added mandatory relay: {}", url);
            }
        }
    }

    fn insert(&self, url: &str, mandatory: bool) {
        let mut state = self.state.write();
        if state.relays.contains_key(url) {
            debug!("Relay already tracked: {}", url);
            return;
        }
        state
            .relays
            .insert(url.to_string(), RelayEndpoint::new(url.to_string(), mandatory));
        debug!("Added relay: {} (total: {})", url, state.relays.len());
    }

    /// Record the outcome of a probe or publish attempt.
    ///
    /// Unknown URLs are logged and ignored: mandatory and discovered relays
    /// are registered before anything can publish to them, so an unknown URL
    /// here is a bug upstream, not something to silently admit.
    pub fn update_health(&self, url: &str, success: bool, response_time: Duration) {
        let mut state = self.state.write();
        let initialized = state.initialized;
        let decay = self.decay;

        let endpoint = match state.relays.get_mut(url) {
            Some(e) => e,
            None => {
                warn!("Health update for unknown relay: {}", url);
                return;
            }
        };

        endpoint.total_attempts += 1;
        if success {
            endpoint.successful_attempts += 1;
            if endpoint.avg_response_time.is_zero() {
                endpoint.avg_response_time = response_time;
            } else {
                let (w_prior, w_new) = RESPONSE_TIME_EWMA;
                let blended = endpoint.avg_response_time.as_secs_f64() * w_prior
                    + response_time.as_secs_f64() * w_new;
                endpoint.avg_response_time = Duration::from_secs_f64(blended);
            }
        }
        endpoint.last_checked = SystemTime::now();

        if initialized {
            let observation = if success { 1.0 } else { 0.0 };
            endpoint.success_rate = endpoint.success_rate * decay + observation * (1.0 - decay);
        } else {
            endpoint.success_rate =
                endpoint.successful_attempts as f64 / endpoint.total_attempts as f64;
        }

        debug!(
            "Health update {}: {} | attempts={}/{} | rate={:.4}",
            if success { "SUCCESS" } else { "FAILED" },
            url,
            endpoint.successful_attempts,
            endpoint.total_attempts,
            endpoint.success_rate
        );
    }

    /// End the initialization phase; subsequent success-rate updates use
    /// exponential decay instead of the simple ratio.
    pub fn mark_initialized(&self) {
        let mut state = self.state.write();
        state.initialized = true;
        info!(
            "Relay pool initialized: switching to exponential decay (factor={:.2}, relays={})",
            self.decay,
            state.relays.len()
        );
    }

    /// Top `top_n` tested endpoints by composite score, best first.
    ///
    /// Untested endpoints are excluded; they enter the ranking after their
    /// first probe.
    pub fn top(&self) -> Vec<RelayEndpoint> {
        let state = self.state.read();

        let mut tested: Vec<RelayEndpoint> = state
            .relays
            .values()
            .filter(|e| e.total_attempts > 0)
            .cloned()
            .collect();

        tested.sort_by(|a, b| {
            let sa = score_endpoint(a, state.initialized);
            let sb = score_endpoint(b, state.initialized);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        tested.truncate(self.top_n);
        tested
    }

    /// Composite score for an endpoint, higher is better.
    pub fn score(&self, endpoint: &RelayEndpoint) -> f64 {
        score_endpoint(endpoint, self.state.read().initialized)
    }

    /// Snapshot of a single endpoint.
    pub fn get(&self, url: &str) -> Option<RelayEndpoint> {
        self.state.read().relays.get(url).cloned()
    }

    /// All tracked URLs, in no particular order.
    pub fn all_urls(&self) -> Vec<String> {
        self.state.read().relays.keys().cloned().collect()
    }

    /// Snapshots of all mandatory endpoints.
    pub fn mandatory(&self) -> Vec<RelayEndpoint> {
        self.state
            .read()
            .relays
            .values()
            .filter(|e| e.mandatory)
            .cloned()
            .collect()
    }

    /// Number of tracked relays.
    pub fn count(&self) -> usize {
        self.state.read().relays.len()
    }

    /// True once [`mark_initialized`](Self::mark_initialized) has been called.
    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Whether a URL is already tracked.
    pub fn contains(&self, url: &str) -> bool {
        self.state.read().relays.contains_key(url)
    }

    /// Administrative removal of a relay.
    pub fn remove(&self, url: &str) {
        let mut state = self.state.write();
        if state.relays.remove(url).is_some() {
            info!("Removed relay: {}", url);
        }
    }
}

fn score_endpoint(endpoint: &RelayEndpoint, initialized: bool) -> f64 {
    let penalty = endpoint.avg_response_time.as_secs_f64() * RESPONSE_TIME_PENALTY;
    let mut score = endpoint.success_rate * SUCCESS_RATE_WEIGHT - penalty;

    // Penalize barely-tested endpoints until the initial sweep settles
    if !initialized && endpoint.total_attempts < MIN_ATTEMPTS_FULL_SCORE {
        score *= 0.5;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_add_is_idempotent() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://relay.example.com");
        pool.add("wss://relay.example.com");
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_new_endpoint_starts_optimistic() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://relay.example.com");

        let endpoint = pool.get("wss://relay.example.com").unwrap();
        assert_eq!(endpoint.success_rate, 1.0);
        assert_eq!(endpoint.total_attempts, 0);
        assert!(endpoint.is_untested());
        assert!(!endpoint.mandatory);
    }

    #[test]
    fn test_update_health_unknown_url_is_ignored() {
        let pool = RelayPool::new(10, 0.95);
        pool.update_health("wss://never.added.example", true, ms(50));
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn test_untested_excluded_from_top() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://tested.example");
        pool.add("wss://untested.example");
        pool.update_health("wss://tested.example", true, ms(50));

        let top = pool.top();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].url, "wss://tested.example");
    }

    #[test]
    fn test_simple_ratio_during_initialization() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://a.example");

        pool.update_health("wss://a.example", true, ms(10));
        pool.update_health("wss://a.example", false, Duration::ZERO);
        pool.update_health("wss://a.example", true, ms(10));
        pool.update_health("wss://a.example", false, Duration::ZERO);

        let endpoint = pool.get("wss://a.example").unwrap();
        assert_eq!(endpoint.total_attempts, 4);
        assert_eq!(endpoint.successful_attempts, 2);
        assert!((endpoint.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_decay_after_initialization() {
        // Three failures during init, then two successes after: the rate
        // follows 0 -> 0.05 -> 0.0975 with decay 0.95
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://x.example");

        for _ in 0..3 {
            pool.update_health("wss://x.example", false, Duration::ZERO);
        }
        assert_eq!(pool.get("wss://x.example").unwrap().success_rate, 0.0);

        pool.mark_initialized();

        pool.update_health("wss://x.example", true, ms(20));
        let rate = pool.get("wss://x.example").unwrap().success_rate;
        assert!((rate - 0.05).abs() < 1e-9, "got {}", rate);

        pool.update_health("wss://x.example", true, ms(20));
        let rate = pool.get("wss://x.example").unwrap().success_rate;
        assert!((rate - 0.0975).abs() < 1e-9, "got {}", rate);
    }

    #[test]
    fn test_response_time_ewma() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://a.example");

        // First sample is taken directly
        pool.update_health("wss://a.example", true, ms(100));
        assert_eq!(
            pool.get("wss://a.example").unwrap().avg_response_time,
            ms(100)
        );

        // Second blends 0.7 * 100ms + 0.3 * 200ms = 130ms
        pool.update_health("wss://a.example", true, ms(200));
        let avg = pool.get("wss://a.example").unwrap().avg_response_time;
        assert!((avg.as_secs_f64() - 0.130).abs() < 1e-6, "got {:?}", avg);
    }

    #[test]
    fn test_failure_does_not_touch_response_time() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://a.example");
        pool.update_health("wss://a.example", true, ms(100));
        pool.update_health("wss://a.example", false, ms(999));
        assert_eq!(
            pool.get("wss://a.example").unwrap().avg_response_time,
            ms(100)
        );
    }

    #[test]
    fn test_score_ordering() {
        // A: 1.0 success, 50ms  -> 100 - 0.5 = 99.5
        // B: 0.8 success, 20ms  -> 80 - 0.2  = 79.8
        // C: 0.95 success, 300ms -> 95 - 3   = 92.0
        let pool = RelayPool::new(2, 0.95);
        for url in ["wss://a.example", "wss://b.example", "wss://c.example"] {
            pool.add(url);
        }
        pool.mark_initialized();

        let seed = |url: &str, rate: f64, avg: Duration| {
            let mut state = pool.state.write();
            let e = state.relays.get_mut(url).unwrap();
            e.success_rate = rate;
            e.avg_response_time = avg;
            e.total_attempts = 10;
            e.successful_attempts = (rate * 10.0) as u64;
        };
        seed("wss://a.example", 1.0, ms(50));
        seed("wss://b.example", 0.8, ms(20));
        seed("wss://c.example", 0.95, ms(300));

        let a = pool.get("wss://a.example").unwrap();
        assert!((pool.score(&a) - 99.5).abs() < 1e-9);

        let top = pool.top();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].url, "wss://a.example");
        assert_eq!(top[1].url, "wss://c.example");
    }

    #[test]
    fn test_low_attempt_penalty_only_during_init() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://a.example");
        pool.update_health("wss://a.example", true, Duration::ZERO);

        let endpoint = pool.get("wss://a.example").unwrap();
        assert!((pool.score(&endpoint) - 50.0).abs() < 1e-9);

        pool.mark_initialized();
        let endpoint = pool.get("wss://a.example").unwrap();
        assert!(pool.score(&endpoint) > 50.0);
    }

    #[test]
    fn test_top_n_zero() {
        let pool = RelayPool::new(0, 0.95);
        pool.add("wss://a.example");
        pool.update_health("wss://a.example", true, ms(10));
        assert!(pool.top().is_empty());
    }

    #[test]
    fn test_mandatory_tracked_while_untested() {
        let pool = RelayPool::new(10, 0.95);
        pool.add_mandatory("wss://mandatory.example");

        let mandatory = pool.mandatory();
        assert_eq!(mandatory.len(), 1);
        assert!(mandatory[0].mandatory);
        assert!(mandatory[0].is_untested());
        // but untested mandatory relays still stay out of the scored set
        assert!(pool.top().is_empty());
    }

    #[test]
    fn test_add_mandatory_promotes_existing() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://a.example");
        pool.update_health("wss://a.example", true, ms(10));
        pool.add_mandatory("wss://a.example");

        let endpoint = pool.get("wss://a.example").unwrap();
        assert!(endpoint.mandatory);
        assert_eq!(endpoint.total_attempts, 1);
    }

    #[test]
    fn test_remove() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://a.example");
        pool.remove("wss://a.example");
        assert_eq!(pool.count(), 0);
        assert!(pool.get("wss://a.example").is_none());
    }

    #[test]
    fn test_invariants_hold_under_mixed_updates() {
        let pool = RelayPool::new(10, 0.95);
        pool.add("wss://a.example");
        pool.mark_initialized();

        for i in 0..50 {
            pool.update_health("wss://a.example", i % 3 != 0, ms(10 + i));
            let e = pool.get("wss://a.example").unwrap();
            assert!(e.successful_attempts <= e.total_attempts);
            assert!((0.0..=1.0).contains(&e.success_rate));
        }
    }
}
