//! Relay discovery.
//!
//! New endpoints enter the pool from two directions: periodic sweeps over the
//! configured seed relays, and relay hints carried inside every ingested
//! event. Seeds are sampled for the event kinds that advertise relays:
//! contact lists (kind 3, relay preferences in `content`) and NIP-65 relay
//! lists (kind 10002, `r` tags). Hints in ordinary events ride in the third
//! position of single-letter tags.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, Kind};
use tracing::{debug, info};

use crate::health::HealthChecker;
use crate::pool::RelayPool;
use crate::transport::RelayTransport;
use crate::url::normalize_relay_url;

/// Number of events requested per seed when sampling.
const SAMPLE_LIMIT: usize = 200;

/// Admits new relay URLs into the pool and schedules their first probes.
pub struct Discovery {
    pool: Arc<RelayPool>,
    checker: Arc<HealthChecker>,
    transport: Arc<dyn RelayTransport>,
    window: Duration,
}

impl Discovery {
    pub fn new(
        pool: Arc<RelayPool>,
        checker: Arc<HealthChecker>,
        transport: Arc<dyn RelayTransport>,
        window: Duration,
    ) -> Self {
        Self {
            pool,
            checker,
            transport,
            window,
        }
    }

    /// Sweep the seed relays: admit them, sample their recent relay-hint
    /// events, admit every extracted hint, then probe everything newly
    /// admitted in one batch. Returns the number of newly admitted relays.
    ///
    /// Called at startup and from the periodic refresh loop.
    pub async fn discover_from_seeds(&self, seeds: &[String]) -> usize {
        let mut admitted: Vec<String> = Vec::new();

        for seed in seeds {
            let seed = match normalize_relay_url(seed).ok() {
                Some(url) => url,
                None => {
                    debug!("Skipping invalid seed relay: {}", seed);
                    continue;
                }
            };
            if !self.pool.contains(&seed) {
                self.pool.add(&seed);
                admitted.push(seed.clone());
            }

            let kinds = [Kind::ContactList.as_u16(), Kind::RelayList.as_u16()];
            let events = match self
                .transport
                .sample_events(&seed, &kinds, SAMPLE_LIMIT, self.window)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    debug!("Sampling {} failed: {}", seed, e);
                    continue;
                }
            };

            let mut hints = 0usize;
            for event in &events {
                for url in extract_relay_urls(event) {
                    hints += 1;
                    if !self.pool.contains(&url) {
                        self.pool.add(&url);
                        admitted.push(url);
                    }
                }
            }
            debug!(
                "Seed {}: {} events sampled, {} hints",
                seed,
                events.len(),
                hints
            );
        }

        info!(
            "Discovery sweep: {} new relays from {} seeds (pool: {})",
            admitted.len(),
            seeds.len(),
            self.pool.count()
        );
        metrics::counter!("relays_discovered_total").increment(admitted.len() as u64);

        self.checker.probe_batch(admitted.clone()).await;
        admitted.len()
    }

    /// Admit a relay URL if the pool does not know it yet, scheduling its
    /// first probe in the background. Returns whether it was new.
    pub fn admit_if_new(&self, url: &str) -> bool {
        let url = match normalize_relay_url(url).ok() {
            Some(u) => u,
            None => return false,
        };
        if self.pool.contains(&url) {
            return false;
        }
        self.pool.add(&url);
        debug!("Admitted relay from event hint: {}", url);
        metrics::counter!("relays_discovered_total").increment(1);

        let checker = Arc::clone(&self.checker);
        tokio::spawn(async move {
            checker.probe(&url).await;
        });
        true
    }
}

/// Extract canonicalized relay URLs hinted at by an event.
///
/// Malformed and non-websocket URLs are dropped silently; duplicates within
/// the event collapse. Insertion order is preserved.
pub fn extract_relay_urls(event: &Event) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    let mut push = |raw: &str| {
        if let Some(url) = normalize_relay_url(raw).ok() {
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
    };

    // Contact lists carry a JSON object in content mapping relay URL to
    // read/write preferences
    if event.kind == Kind::ContactList {
        if let Ok(serde_json::Value::Object(map)) =
            serde_json::from_str::<serde_json::Value>(&event.content)
        {
            for url in map.keys() {
                push(url);
            }
        }
    }

    for tag in event.tags.iter() {
        let parts = tag.as_slice();
        let Some(name) = parts.first() else { continue };

        // NIP-65 relay lists: ["r", <url>, <optional marker>]; the marker is
        // irrelevant here
        if event.kind == Kind::RelayList && name == "r" {
            if let Some(url) = parts.get(1) {
                push(url);
            }
            continue;
        }

        // standard hint position: ["e"|"p"|.., <value>, <relay url>, ..]
        if name.len() == 1 && name.chars().all(|c| c.is_ascii_alphabetic()) {
            if let Some(url) = parts.get(2) {
                push(url);
            }
        }
    }

    urls
}
