//! Event broadcaster: dedup, buffering, worker pool, and fan-out.
//!
//! Accepted events flow through a bounded queue into a pool of long-lived
//! worker tasks. Each worker takes one event at a time, resolves the target
//! set (scored top-N union the mandatory relays), publishes to every target
//! concurrently, and reports every outcome to the health checker. The worker
//! waits for its whole fan-out group before taking the next event, which
//! bounds peak outbound concurrency at `workers · (top_n + mandatory)`.
//!
//! Delivery is best-effort and at-most-once per target per event: there are
//! no retries, and events with no available targets are dropped with a
//! warning.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nostr::Event;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::DedupCache;
use crate::config::BroadcastConfig;
use crate::health::HealthChecker;
use crate::pool::RelayPool;
use crate::queue::{EventQueue, PushOutcome};
use crate::stats::{percentage, BroadcastStats, CacheStats, QueueStats, RelayCounts, RelayView};
use crate::transport::RelayTransport;

/// The broadcast pipeline. Construct with [`Broadcaster::new`], then call
/// [`start`](Broadcaster::start) to spawn the workers and the cache reaper.
pub struct Broadcaster {
    pool: Arc<RelayPool>,
    checker: Arc<HealthChecker>,
    transport: Arc<dyn RelayTransport>,
    cache: DedupCache,
    queue: EventQueue<Arc<Event>>,
    workers: usize,
    publish_timeout: Duration,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(
        pool: Arc<RelayPool>,
        checker: Arc<HealthChecker>,
        transport: Arc<dyn RelayTransport>,
        config: &BroadcastConfig,
    ) -> Self {
        debug!(
            "Broadcaster: {} workers, channel capacity {}, cache ttl {:?}",
            config.workers,
            config.channel_capacity(),
            config.cache_ttl
        );
        Self {
            pool,
            checker,
            transport,
            cache: DedupCache::new(config.cache_ttl, config.cache_max_size),
            queue: EventQueue::new(config.channel_capacity()),
            workers: config.workers,
            publish_timeout: config.publish_timeout,
            shutting_down: AtomicBool::new(false),
            shutdown_tx: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks and the dedup cache reaper.
    pub fn start(self: Arc<Self>) {
        let mut tasks = self.tasks.lock();
        for worker_id in 0..self.workers {
            let this = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                this.worker_loop(worker_id).await;
            }));
        }
        let this = Arc::clone(&self);
        // subscribe before spawning so a shutdown signalled immediately after
        // start() cannot slip past the reaper
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            this.reaper_loop(shutdown).await;
        }));
        info!("Broadcaster started with {} workers", self.workers);
    }

    /// Whether an event id was already broadcast within the cache TTL.
    ///
    /// This is the duplicate check the ingress layer runs before accepting an
    /// event; it updates the hit/miss counters.
    pub fn is_cached(&self, fingerprint: &str) -> bool {
        self.cache.is_cached(fingerprint)
    }

    /// Accept an event for broadcast.
    ///
    /// Marks the fingerprint in the dedup cache and queues the event. Returns
    /// false if the event was dropped because shutdown has begun.
    pub fn enqueue(&self, event: Event) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!("Dropping event {}: shutdown in progress", event.id.to_hex());
            return false;
        }

        self.cache.insert(&event.id.to_hex());

        match self.queue.push(Arc::new(event)) {
            PushOutcome::Queued => {}
            PushOutcome::Overflowed => {
                warn!(
                    "Broadcast channel saturated, event diverted to overflow (queued: {})",
                    self.queue.total_queued()
                );
                metrics::counter!("broadcast_overflow_total").increment(1);
            }
            PushOutcome::Closed => {
                warn!("Dropping event: broadcast queue closed");
                return false;
            }
        }
        metrics::gauge!("broadcast_queue_depth").set(self.queue.total_queued() as f64);
        true
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!("Broadcast worker {} running", worker_id);
        while let Some(event) = self.queue.next().await {
            metrics::gauge!("broadcast_queue_depth").set(self.queue.total_queued() as f64);
            self.fan_out(&event).await;
        }
        debug!("Broadcast worker {} exiting", worker_id);
    }

    /// Publish one event to the union of the scored top-N and the mandatory
    /// set, concurrently, and wait for every attempt to finish.
    async fn fan_out(&self, event: &Arc<Event>) {
        let top = self.pool.top();
        let mandatory = self.pool.mandatory();

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(top.len() + mandatory.len());
        for endpoint in mandatory.iter().chain(top.iter()) {
            if seen.insert(endpoint.url.clone()) {
                targets.push(endpoint.url.clone());
            }
        }

        if targets.is_empty() {
            warn!(
                "No relays available for broadcasting event {} (kind {})",
                event.id.to_hex(),
                event.kind.as_u16()
            );
            metrics::counter!("broadcast_no_targets_total").increment(1);
            return;
        }

        debug!(
            "Broadcasting event {} (kind {}) to {} relays ({} mandatory + {} top)",
            event.id.to_hex(),
            event.kind.as_u16(),
            targets.len(),
            mandatory.len(),
            top.len()
        );

        let mut attempts = JoinSet::new();
        for url in targets.iter().cloned() {
            let transport = Arc::clone(&self.transport);
            let checker = Arc::clone(&self.checker);
            let event = Arc::clone(event);
            let deadline = self.publish_timeout;
            attempts.spawn(async move {
                let result = transport.publish(&url, &event, deadline).await;
                let success = result.is_ok();
                checker.record_publish(&url, &result);
                success
            });
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                _ => failed += 1,
            }
        }

        debug!(
            "Broadcast complete for event {} | success={}, failed={}, total={}",
            event.id.to_hex(),
            succeeded,
            failed,
            targets.len()
        );
        metrics::counter!("broadcast_publish_total").increment(targets.len() as u64);
        metrics::counter!("broadcast_publish_failures_total").increment(failed as u64);
    }

    /// Periodically evict expired dedup entries until shutdown.
    async fn reaper_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.cache.reaper_interval();
        debug!("Dedup reaper running, interval {:?}", interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {
                    self.cache.purge_expired();
                    metrics::gauge!("dedup_cache_size").set(self.cache.len() as f64);
                }
            }
        }
        debug!("Dedup reaper exiting");
    }

    /// Graceful shutdown: refuse new events, close the queue, and wait for
    /// the workers to drain everything already accepted. The reaper exits as
    /// well. In-flight publishes still run under their per-attempt deadline.
    pub async fn shutdown(&self) {
        info!("Broadcaster shutting down, draining queue...");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.queue.close();
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Broadcast task ended abnormally: {}", e);
            }
        }
        info!("Broadcaster drained and stopped");
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> BroadcastStats {
        let top = self.pool.top();
        let mandatory = self.pool.mandatory();
        let queue = self.queue.snapshot();
        let cache = self.cache.stats();

        let view = |e: &crate::pool::RelayEndpoint| RelayView {
            url: e.url.clone(),
            score: self.pool.score(e),
            success_rate: e.success_rate,
            avg_response_ms: e.avg_response_time.as_millis() as u64,
            total_attempts: e.total_attempts,
        };

        BroadcastStats {
            relays: RelayCounts {
                total_relays: self.pool.count(),
                active_relays: top.len(),
                mandatory_relays: mandatory.len(),
            },
            queue: QueueStats {
                workers: self.workers,
                channel_size: queue.channel_size,
                channel_capacity: queue.channel_capacity,
                channel_utilization_pct: percentage(
                    queue.channel_size as u64,
                    queue.channel_capacity as u64,
                ),
                overflow_size: queue.overflow_size,
                total_queued: queue.total_queued,
                peak_size: queue.peak_size,
                saturation_count: queue.saturation_count,
                is_saturated: queue.is_saturated,
                last_saturation: queue.last_saturation.and_then(|t| {
                    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
                }),
            },
            cache: CacheStats {
                size: cache.size,
                max_size: cache.max_size,
                utilization_pct: percentage(cache.size as u64, cache.max_size as u64),
                hits: cache.hits,
                misses: cache.misses,
                hit_rate_pct: percentage(cache.hits, cache.hits + cache.misses),
            },
            top_relays: top.iter().map(view).collect(),
            mandatory_relays: mandatory.iter().map(view).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use nostr::{EventBuilder, Keys, Kind, Timestamp};

    fn make_event(content: &str) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::TextNote, content)
            .custom_created_at(Timestamp::from(1700000000))
            .sign_with_keys(&keys)
            .expect("Failed to sign event")
    }

    struct Fixture {
        pool: Arc<RelayPool>,
        transport: Arc<MockTransport>,
        broadcaster: Arc<Broadcaster>,
    }

    fn setup(config: BroadcastConfig, top_n: usize) -> Fixture {
        let pool = Arc::new(RelayPool::new(top_n, config.decay));
        let transport = Arc::new(MockTransport::new());
        let checker = Arc::new(HealthChecker::new(
            Arc::clone(&pool),
            Arc::clone(&transport) as Arc<dyn RelayTransport>,
            config.initial_timeout,
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&pool),
            checker,
            Arc::clone(&transport) as Arc<dyn RelayTransport>,
            &config,
        ));
        Fixture {
            pool,
            transport,
            broadcaster,
        }
    }

    /// Register a relay as tested and reachable with the given latency.
    fn seed_relay(fixture: &Fixture, url: &str, latency: Duration) {
        fixture.pool.add(url);
        fixture.transport.set_reachable(url, latency);
        fixture.pool.update_health(url, true, latency);
    }

    async fn wait_for_drain(broadcaster: &Broadcaster) {
        for _ in 0..200 {
            if broadcaster.queue.total_queued() == 0 {
                // one extra tick so in-flight fan-outs finish
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never drained");
    }

    #[tokio::test]
    async fn test_dedup_within_ttl() {
        // first submission broadcasts to the top 3; the resubmission is
        // caught by the cache and never advances the queue
        let config = BroadcastConfig {
            workers: 2,
            cache_ttl: Duration::from_secs(600),
            ..Default::default()
        };
        let fixture = setup(config, 3);
        for (url, ms) in [
            ("wss://a.example", 10),
            ("wss://b.example", 20),
            ("wss://c.example", 30),
            ("wss://d.example", 500),
        ] {
            seed_relay(&fixture, url, Duration::from_millis(ms));
        }
        Arc::clone(&fixture.broadcaster).start();

        let event = make_event("first submission");
        let id = event.id.to_hex();

        assert!(!fixture.broadcaster.is_cached(&id)); // miss
        assert!(fixture.broadcaster.enqueue(event.clone()));
        wait_for_drain(&fixture.broadcaster).await;

        let published = fixture.transport.published();
        assert_eq!(published.len(), 3);
        let urls: HashSet<&str> = published.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(
            urls,
            HashSet::from(["wss://a.example", "wss://b.example", "wss://c.example"])
        );

        // resubmission within the TTL
        assert!(fixture.broadcaster.is_cached(&id)); // hit
        let stats = fixture.broadcaster.stats();
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.cache.misses, 1);
        assert_eq!(stats.queue.total_queued, 0);

        fixture.broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_while_workers_stalled() {
        // workers not started: 25 events against a capacity-20 channel
        let config = BroadcastConfig {
            workers: 2,
            ..Default::default()
        };
        let fixture = setup(config, 3);

        for i in 0..25 {
            assert!(fixture.broadcaster.enqueue(make_event(&format!("burst {}", i))));
        }

        let stats = fixture.broadcaster.stats();
        assert_eq!(stats.queue.channel_size, 20);
        assert_eq!(stats.queue.overflow_size, 5);
        assert_eq!(stats.queue.total_queued, 25);
        assert_eq!(stats.queue.peak_size, 25);
        assert_eq!(stats.queue.saturation_count, 1);
        assert!(stats.queue.is_saturated);

        // resume: with no tested relays fan-out is a no-op, the queue just drains
        Arc::clone(&fixture.broadcaster).start();
        wait_for_drain(&fixture.broadcaster).await;

        let stats = fixture.broadcaster.stats();
        assert_eq!(stats.queue.total_queued, 0);
        assert_eq!(stats.queue.overflow_size, 0);
        assert_eq!(stats.queue.peak_size, 25);

        fixture.broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_mandatory_always_contacted_exactly_once() {
        // top_n = 2 with three better-scored relays: the fan-out set is the
        // top two plus the mandatory relay, each contacted once
        let config = BroadcastConfig {
            workers: 1,
            ..Default::default()
        };
        let fixture = setup(config, 2);
        seed_relay(&fixture, "wss://a.example", Duration::from_millis(10));
        seed_relay(&fixture, "wss://b.example", Duration::from_millis(20));
        seed_relay(&fixture, "wss://c.example", Duration::from_millis(30));
        fixture.pool.add_mandatory("wss://m.example");
        fixture.transport.set_reachable("wss://m.example", Duration::from_millis(900));

        Arc::clone(&fixture.broadcaster).start();
        fixture.broadcaster.enqueue(make_event("mandatory fanout"));
        wait_for_drain(&fixture.broadcaster).await;

        let published = fixture.transport.published();
        assert_eq!(published.len(), 3);
        let urls: HashSet<&str> = published.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(
            urls,
            HashSet::from(["wss://a.example", "wss://b.example", "wss://m.example"])
        );

        fixture.broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_mandatory_in_top_not_contacted_twice() {
        let config = BroadcastConfig {
            workers: 1,
            ..Default::default()
        };
        let fixture = setup(config, 2);
        seed_relay(&fixture, "wss://m.example", Duration::from_millis(5));
        fixture.pool.add_mandatory("wss://m.example");

        Arc::clone(&fixture.broadcaster).start();
        fixture.broadcaster.enqueue(make_event("union"));
        wait_for_drain(&fixture.broadcaster).await;

        assert_eq!(fixture.transport.published().len(), 1);
        fixture.broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_target_set_drops_event() {
        let config = BroadcastConfig {
            workers: 1,
            ..Default::default()
        };
        let fixture = setup(config, 3);
        Arc::clone(&fixture.broadcaster).start();

        fixture.broadcaster.enqueue(make_event("nowhere"));
        wait_for_drain(&fixture.broadcaster).await;

        assert!(fixture.transport.published().is_empty());
        fixture.broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_top_n_zero_reaches_only_mandatory() {
        let config = BroadcastConfig {
            workers: 1,
            ..Default::default()
        };
        let fixture = setup(config, 0);
        seed_relay(&fixture, "wss://scored.example", Duration::from_millis(5));
        fixture.pool.add_mandatory("wss://m.example");
        fixture.transport.set_reachable("wss://m.example", Duration::from_millis(5));

        Arc::clone(&fixture.broadcaster).start();
        fixture.broadcaster.enqueue(make_event("mandatory-only"));
        wait_for_drain(&fixture.broadcaster).await;

        let published = fixture.transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "wss://m.example");
        fixture.broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_publishes_feed_health() {
        let config = BroadcastConfig {
            workers: 1,
            ..Default::default()
        };
        let fixture = setup(config, 5);
        seed_relay(&fixture, "wss://up.example", Duration::from_millis(5));
        seed_relay(&fixture, "wss://down.example", Duration::from_millis(5));
        fixture.transport.set_unreachable("wss://down.example");

        Arc::clone(&fixture.broadcaster).start();
        fixture.broadcaster.enqueue(make_event("health"));
        wait_for_drain(&fixture.broadcaster).await;

        let up = fixture.pool.get("wss://up.example").unwrap();
        let down = fixture.pool.get("wss://down.example").unwrap();
        assert_eq!(up.total_attempts, 2);
        assert_eq!(up.successful_attempts, 2);
        assert_eq!(down.total_attempts, 2);
        assert_eq!(down.successful_attempts, 1);

        fixture.broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything() {
        // events stacked in channel and overflow are all broadcast before
        // shutdown returns, and later enqueues are refused
        let config = BroadcastConfig {
            workers: 1,
            ..Default::default()
        };
        let fixture = setup(config, 3);
        seed_relay(&fixture, "wss://a.example", Duration::from_millis(1));

        for i in 0..13 {
            assert!(fixture.broadcaster.enqueue(make_event(&format!("drain {}", i))));
        }
        // capacity is 10 for one worker: 10 in channel, 3 in overflow
        assert_eq!(fixture.broadcaster.stats().queue.overflow_size, 3);

        Arc::clone(&fixture.broadcaster).start();
        fixture.broadcaster.shutdown().await;

        assert_eq!(fixture.transport.published().len(), 13);
        let stats = fixture.broadcaster.stats();
        assert_eq!(stats.queue.total_queued, 0);

        assert!(!fixture.broadcaster.enqueue(make_event("late")));
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let config = BroadcastConfig {
            workers: 2,
            ..Default::default()
        };
        let fixture = setup(config, 2);
        seed_relay(&fixture, "wss://a.example", Duration::from_millis(10));
        fixture.pool.add_mandatory("wss://m.example");
        fixture.pool.add("wss://untested.example");

        let stats = fixture.broadcaster.stats();
        assert_eq!(stats.relays.total_relays, 3);
        assert_eq!(stats.relays.active_relays, 1);
        assert_eq!(stats.relays.mandatory_relays, 1);
        assert_eq!(stats.queue.workers, 2);
        assert_eq!(stats.queue.channel_capacity, 20);
        assert_eq!(stats.top_relays.len(), 1);
        assert_eq!(stats.top_relays[0].url, "wss://a.example");
        assert_eq!(stats.mandatory_relays.len(), 1);
    }
}
