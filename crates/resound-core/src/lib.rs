//! Fan-out engine for the Resound broadcast relay.
//!
//! Resound is a zero-storage relay: events arrive on a websocket endpoint,
//! get deduplicated, and are republished to the best-scoring downstream
//! relays plus an operator-configured mandatory set. This crate is the engine
//! behind that. It holds no protocol framing and no HTTP; the daemon crate
//! wires those on top of [`IngressAdapter`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  IngressAdapter  │  should_reject (dedup) / on_event
//! └────────┬─────────┘
//!          │                      ┌─────────────┐
//!          ├── relay hints ──────▶│  Discovery  │──▶ admit + probe
//!          ▼                      └─────────────┘
//! ┌──────────────────┐
//! │   Broadcaster    │  dedup cache + bounded queue + overflow
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐           ┌───────────────┐
//! │   Worker pool    │──publish─▶│ HealthChecker │──▶ RelayPool scores
//! └──────────────────┘           └───────────────┘
//! ```
//!
//! Fan-out targets are `RelayPool::top()` ∪ the mandatory set. Every publish
//! outcome feeds back into the pool's scores, so the selection tracks relay
//! health continuously. Nothing is persisted; a restart begins from the seed
//! relays.

pub mod broadcaster;
pub mod cache;
pub mod config;
pub mod discovery;
mod error;
pub mod health;
pub mod ingress;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod transport;
pub mod url;

pub use broadcaster::Broadcaster;
pub use cache::{DedupCache, DedupCacheStats};
pub use config::BroadcastConfig;
pub use discovery::{extract_relay_urls, Discovery};
pub use error::{Error, Result};
pub use health::HealthChecker;
pub use ingress::{IngressAdapter, REJECT_DUPLICATE};
pub use pool::{RelayEndpoint, RelayPool};
pub use stats::{BroadcastStats, CacheStats, QueueStats, RelayCounts, RelayView};
pub use transport::{RelayTransport, WebSocketTransport};
