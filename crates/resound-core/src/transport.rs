//! Outbound relay connections.
//!
//! Every outbound interaction (initial probes, per-event publishes, and
//! discovery sampling) goes through the [`RelayTransport`] trait so the
//! engine can be exercised without a network. The production implementation
//! opens one short-lived websocket per attempt and closes it on exit; there
//! is no connection reuse, which keeps failure domains per-attempt and makes
//! the per-attempt deadline trivially enforceable.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nostr::Event;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::{Error, Result};

/// Outbound transport to downstream relays.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a connection to `url` and close it again, returning the connect
    /// latency. Used for liveness probes.
    async fn probe(&self, url: &str, deadline: Duration) -> Result<Duration>;

    /// Publish `event` to `url` under a per-attempt deadline. Succeeds iff
    /// the relay acknowledges with `["OK", id, true, ..]` in time; returns
    /// the elapsed time on success.
    async fn publish(&self, url: &str, event: &Event, deadline: Duration) -> Result<Duration>;

    /// Subscribe to `url` for events of the given kinds and collect what
    /// arrives until EOSE or the window elapses. Used by discovery to sample
    /// relay-hint events from seeds.
    async fn sample_events(
        &self,
        url: &str,
        kinds: &[u16],
        limit: usize,
        window: Duration,
    ) -> Result<Vec<Event>>;
}

/// Websocket transport speaking NIP-01 frames over tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Guard against non-websocket URLs before handing them to the connector.
fn check_scheme(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(Error::InvalidUrl(format!(
            "scheme must be ws or wss, got {}",
            parsed.scheme()
        )));
    }
    Ok(())
}

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn probe(&self, url: &str, deadline: Duration) -> Result<Duration> {
        check_scheme(url)?;
        let start = Instant::now();
        let (mut ws, _) = match timeout(deadline, connect_async(url)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(Error::WebSocket(e.to_string())),
            Err(_) => return Err(Error::Timeout(deadline)),
        };
        let elapsed = start.elapsed();
        let _ = ws.close(None).await;
        Ok(elapsed)
    }

    async fn publish(&self, url: &str, event: &Event, deadline: Duration) -> Result<Duration> {
        check_scheme(url)?;
        let start = Instant::now();
        let attempt = async {
            let (mut ws, _) = connect_async(url)
                .await
                .map_err(|e| Error::WebSocket(e.to_string()))?;

            let frame = json!(["EVENT", event]).to_string();
            ws.send(Message::Text(frame))
                .await
                .map_err(|e| Error::WebSocket(e.to_string()))?;

            let event_id = event.id.to_hex();
            let result = loop {
                let msg = match ws.next().await {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => break Err(Error::WebSocket(e.to_string())),
                    None => break Err(Error::WebSocket("connection closed".into())),
                };
                match msg {
                    Message::Text(text) => {
                        if let Some((id, accepted, reason)) = parse_ok_frame(&text) {
                            if id != event_id {
                                continue;
                            }
                            if accepted {
                                break Ok(());
                            }
                            break Err(Error::PublishRejected(reason));
                        }
                    }
                    Message::Ping(data) => {
                        ws.send(Message::Pong(data))
                            .await
                            .map_err(|e| Error::WebSocket(e.to_string()))?;
                    }
                    Message::Close(_) => {
                        break Err(Error::WebSocket("connection closed".into()));
                    }
                    _ => {}
                }
            };

            let _ = ws.close(None).await;
            result
        };

        match timeout(deadline, attempt).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    async fn sample_events(
        &self,
        url: &str,
        kinds: &[u16],
        limit: usize,
        window: Duration,
    ) -> Result<Vec<Event>> {
        check_scheme(url)?;
        let attempt = async {
            let (mut ws, _) = connect_async(url)
                .await
                .map_err(|e| Error::WebSocket(e.to_string()))?;

            let sub_id = "resound-discovery";
            let req = json!(["REQ", sub_id, {"kinds": kinds, "limit": limit}]).to_string();
            ws.send(Message::Text(req))
                .await
                .map_err(|e| Error::WebSocket(e.to_string()))?;

            let mut events = Vec::new();
            loop {
                let msg = match ws.next().await {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        debug!("Sample read error from {}: {}", url, e);
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => match parse_sampled_event(&text, sub_id) {
                        Sampled::Event(event) => events.push(*event),
                        Sampled::Eose => break,
                        Sampled::Other => {}
                    },
                    Message::Ping(data) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            let close = json!(["CLOSE", sub_id]).to_string();
            let _ = ws.send(Message::Text(close)).await;
            let _ = ws.close(None).await;
            Ok(events)
        };

        match timeout(window, attempt).await {
            Ok(result) => result,
            // a timeout just ends the sampling window; whatever arrived is lost
            // with the connection, which the next refresh makes up for
            Err(_) => Ok(Vec::new()),
        }
    }
}

/// Parse `["OK", <event_id>, <bool>, <message>]`, if that is what this is.
fn parse_ok_frame(text: &str) -> Option<(String, bool, String)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    if arr.len() < 3 || arr[0].as_str()? != "OK" {
        return None;
    }
    let id = arr[1].as_str()?.to_string();
    let accepted = arr[2].as_bool()?;
    let reason = arr
        .get(3)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some((id, accepted, reason))
}

enum Sampled {
    Event(Box<Event>),
    Eose,
    Other,
}

/// Classify a relay frame received while sampling a subscription.
fn parse_sampled_event(text: &str, sub_id: &str) -> Sampled {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Sampled::Other,
    };
    let arr = match value.as_array() {
        Some(a) if !a.is_empty() => a,
        _ => return Sampled::Other,
    };
    match arr[0].as_str() {
        Some("EVENT") if arr.len() >= 3 && arr[1].as_str() == Some(sub_id) => {
            match serde_json::from_value::<Event>(arr[2].clone()) {
                Ok(event) => Sampled::Event(Box::new(event)),
                Err(e) => {
                    debug!("Discarding unparseable sampled event: {}", e);
                    Sampled::Other
                }
            }
        }
        Some("EOSE") if arr.get(1).and_then(|v| v.as_str()) == Some(sub_id) => Sampled::Eose,
        _ => Sampled::Other,
    }
}
