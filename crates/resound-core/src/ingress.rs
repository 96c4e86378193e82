//! Ingress contract for the websocket framing layer.
//!
//! The framing layer never touches broadcaster internals; it asks
//! [`IngressAdapter::should_reject`] before accepting an event and hands every
//! accepted event (regular and ephemeral kinds alike) to
//! [`IngressAdapter::on_event`].

use std::sync::Arc;

use nostr::Event;
use tracing::debug;

use crate::broadcaster::Broadcaster;
use crate::discovery::{extract_relay_urls, Discovery};

/// Reason string returned for duplicate events, in NIP-01 machine-readable
/// `prefix: message` form.
pub const REJECT_DUPLICATE: &str = "duplicate: event already broadcast";

/// Stable interface between the protocol layer and the broadcast engine.
pub struct IngressAdapter {
    discovery: Arc<Discovery>,
    broadcaster: Arc<Broadcaster>,
}

impl IngressAdapter {
    pub fn new(discovery: Arc<Discovery>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            discovery,
            broadcaster,
        }
    }

    /// Whether an inbound event must be rejected, and why.
    ///
    /// `Some(reason)` means reject. The only structural rejection the engine
    /// issues is a dedup-cache hit.
    pub fn should_reject(&self, event: &Event) -> Option<&'static str> {
        if self.broadcaster.is_cached(&event.id.to_hex()) {
            debug!(
                "Rejecting duplicate event {} (kind {})",
                event.id.to_hex(),
                event.kind.as_u16()
            );
            return Some(REJECT_DUPLICATE);
        }
        None
    }

    /// Handle one accepted event: mine it for relay hints, then queue it for
    /// broadcast. Best-effort; never fails the caller.
    pub fn on_event(&self, event: Event) {
        let hints = extract_relay_urls(&event);
        if !hints.is_empty() {
            debug!(
                "Extracted {} relay hints from event {} (kind {})",
                hints.len(),
                event.id.to_hex(),
                event.kind.as_u16()
            );
            for url in hints {
                self.discovery.admit_if_new(&url);
            }
        }

        metrics::counter!("events_ingested_total").increment(1);
        self.broadcaster.enqueue(event);
    }
}
