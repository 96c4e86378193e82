//! Relay health checking.
//!
//! The checker is the only writer of health outcomes into the pool: initial
//! probes when a relay is first admitted, batch probes during discovery
//! sweeps, and the per-publish outcomes reported by the broadcaster. Network
//! failures never propagate out of here; they become failed health updates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::pool::RelayPool;
use crate::transport::RelayTransport;
use crate::Result;

/// Upper bound on concurrent probes in a batch.
const MAX_CONCURRENT_PROBES: usize = 20;

/// Probes relays and feeds outcomes into the pool.
pub struct HealthChecker {
    pool: Arc<RelayPool>,
    transport: Arc<dyn RelayTransport>,
    initial_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        pool: Arc<RelayPool>,
        transport: Arc<dyn RelayTransport>,
        initial_timeout: Duration,
    ) -> Self {
        debug!("Health checker ready, probe timeout={:?}", initial_timeout);
        Self {
            pool,
            transport,
            initial_timeout,
        }
    }

    /// Probe a single relay and record the outcome. Returns whether the
    /// relay was reachable.
    pub async fn probe(&self, url: &str) -> bool {
        probe_one(&self.pool, self.transport.as_ref(), self.initial_timeout, url).await
    }

    /// Probe a set of relays concurrently, bounded to
    /// [`MAX_CONCURRENT_PROBES`] at a time, and log a batch summary.
    pub async fn probe_batch(&self, urls: Vec<String>) {
        if urls.is_empty() {
            return;
        }
        let total = urls.len();
        info!("Probing {} relays (max {} concurrent)", total, MAX_CONCURRENT_PROBES);

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let mut tasks = JoinSet::new();

        for url in urls {
            let semaphore = Arc::clone(&semaphore);
            let pool = Arc::clone(&self.pool);
            let transport = Arc::clone(&self.transport);
            let timeout = self.initial_timeout;
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return false;
                };
                probe_one(&pool, transport.as_ref(), timeout, &url).await
            });
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    debug!("Probe task panicked: {}", e);
                    failed += 1;
                }
            }
        }

        info!(
            "Probe batch complete: {} ok, {} failed of {} in {:.2}s",
            succeeded,
            failed,
            total,
            started.elapsed().as_secs_f64()
        );
        metrics::counter!("probes_total").increment(total as u64);
        metrics::counter!("probe_failures_total").increment(failed as u64);
    }

    /// Record a publish attempt's outcome against the relay's health.
    pub fn record_publish(&self, url: &str, result: &Result<Duration>) {
        match result {
            Ok(elapsed) => self.pool.update_health(url, true, *elapsed),
            Err(e) => {
                debug!("Publish to {} failed: {}", url, e);
                self.pool.update_health(url, false, Duration::ZERO);
            }
        }
    }
}

async fn probe_one(
    pool: &RelayPool,
    transport: &dyn RelayTransport,
    timeout: Duration,
    url: &str,
) -> bool {
    match transport.probe(url, timeout).await {
        Ok(elapsed) => {
            debug!("Probe ok: {} ({:.1}ms)", url, elapsed.as_secs_f64() * 1000.0);
            pool.update_health(url, true, elapsed);
            true
        }
        Err(e) => {
            debug!("Probe failed: {} ({})", url, e);
            pool.update_health(url, false, Duration::ZERO);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::Error;

    fn setup() -> (Arc<RelayPool>, Arc<MockTransport>, HealthChecker) {
        let pool = Arc::new(RelayPool::new(10, 0.95));
        let transport = Arc::new(MockTransport::new());
        let checker = HealthChecker::new(
            Arc::clone(&pool),
            Arc::clone(&transport) as Arc<dyn RelayTransport>,
            Duration::from_secs(5),
        );
        (pool, transport, checker)
    }

    #[tokio::test]
    async fn test_probe_success_updates_pool() {
        let (pool, transport, checker) = setup();
        pool.add("wss://up.example");
        transport.set_reachable("wss://up.example", Duration::from_millis(40));

        assert!(checker.probe("wss://up.example").await);

        let endpoint = pool.get("wss://up.example").unwrap();
        assert_eq!(endpoint.total_attempts, 1);
        assert_eq!(endpoint.successful_attempts, 1);
        assert_eq!(endpoint.avg_response_time, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_probe_failure_updates_pool() {
        let (pool, _transport, checker) = setup();
        pool.add("wss://down.example");

        assert!(!checker.probe("wss://down.example").await);

        let endpoint = pool.get("wss://down.example").unwrap();
        assert_eq!(endpoint.total_attempts, 1);
        assert_eq!(endpoint.successful_attempts, 0);
        assert_eq!(endpoint.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_probe_batch_covers_all_urls() {
        let (pool, transport, checker) = setup();
        let mut urls = Vec::new();
        for i in 0..30 {
            let url = format!("wss://relay-{}.example", i);
            pool.add(&url);
            if i % 2 == 0 {
                transport.set_reachable(&url, Duration::from_millis(10));
            }
            urls.push(url);
        }

        checker.probe_batch(urls.clone()).await;

        assert_eq!(transport.probed().len(), 30);
        for (i, url) in urls.iter().enumerate() {
            let endpoint = pool.get(url).unwrap();
            assert_eq!(endpoint.total_attempts, 1);
            assert_eq!(endpoint.successful_attempts, u64::from(i % 2 == 0));
        }
    }

    #[tokio::test]
    async fn test_record_publish() {
        let (pool, _transport, checker) = setup();
        pool.add("wss://a.example");

        checker.record_publish("wss://a.example", &Ok(Duration::from_millis(25)));
        checker.record_publish(
            "wss://a.example",
            &Err(Error::WebSocket("connection refused".into())),
        );

        let endpoint = pool.get("wss://a.example").unwrap();
        assert_eq!(endpoint.total_attempts, 2);
        assert_eq!(endpoint.successful_attempts, 1);
    }
}
