//! HTTP surface: websocket ingress, NIP-11, stats and health endpoints.
//!
//! A single port serves everything. `/` upgrades to the Nostr websocket when
//! asked, answers NIP-11 on `Accept: application/nostr+json`, and otherwise
//! shows a short landing text. `/stats` and `/health` expose the
//! broadcaster's snapshot.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use nostr::Event;
use serde::Serialize;
use tracing::{debug, warn};

use resound_core::{Broadcaster, BroadcastStats, IngressAdapter};

use crate::nip11::{RelayInformationDocument, RELAY_INFO_ACCEPT_HEADER};
use crate::ws::{ClientFrame, RelayFrame};

/// Shared state behind every handler.
pub struct AppState {
    pub ingress: IngressAdapter,
    pub broadcaster: Arc<Broadcaster>,
    pub info: RelayInformationDocument,
}

/// Build the router for the public port.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .with_state(state)
}

async fn root(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        return ws.on_upgrade(move |socket| handle_socket(socket, state));
    }

    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains(RELAY_INFO_ACCEPT_HEADER));
    if wants_info {
        return Json(state.info.clone()).into_response();
    }

    let name = state.info.name.as_deref().unwrap_or("Resound");
    let description = state.info.description.as_deref().unwrap_or_default();
    (
        StatusCode::OK,
        format!(
            "{}\n\n{}\n\nConnect a Nostr client over websocket to publish.\nStats: /stats\n",
            name, description
        ),
    )
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    while let Some(received) = socket.recv().await {
        let text = match received {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let reply = match ClientFrame::from_json(&text) {
            Ok(ClientFrame::Event(event)) => Some(handle_event(&state, *event)),
            Ok(ClientFrame::Req { subscription_id }) => {
                // nothing is stored, so a subscription can only ever be empty
                let eose = RelayFrame::eose(&subscription_id);
                if socket.send(Message::Text(eose.to_json())).await.is_err() {
                    break;
                }
                Some(RelayFrame::closed(
                    &subscription_id,
                    "unsupported: this relay does not store events",
                ))
            }
            Ok(ClientFrame::Close { .. }) => None,
            Err(e) => {
                debug!("Unparseable client frame: {}", e);
                Some(RelayFrame::notice(format!("invalid: {}", e)))
            }
        };

        if let Some(frame) = reply {
            if socket.send(Message::Text(frame.to_json())).await.is_err() {
                break;
            }
        }
    }
}

fn handle_event(state: &AppState, event: Event) -> RelayFrame {
    let event_id = event.id.to_hex();

    if !event.verify_id() {
        return RelayFrame::ok_rejected(event_id, "invalid: event id does not match");
    }
    if !event.verify_signature() {
        return RelayFrame::ok_rejected(event_id, "invalid: bad signature");
    }

    if let Some(reason) = state.ingress.should_reject(&event) {
        return RelayFrame::ok_rejected(event_id, reason);
    }

    state.ingress.on_event(event);
    RelayFrame::ok_accepted(event_id)
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: BroadcastStats,
    timestamp: u64,
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: state.broadcaster.stats(),
        timestamp: unix_now(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    total_relays: usize,
    active_relays: usize,
    timestamp: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let stats = state.broadcaster.stats();
    let (status, code) = health_status(stats.relays.total_relays, stats.relays.active_relays);
    if code != StatusCode::OK {
        warn!(
            "Health check {}: {} total relays, {} active",
            status, stats.relays.total_relays, stats.relays.active_relays
        );
    }
    (
        code,
        Json(HealthResponse {
            status,
            total_relays: stats.relays.total_relays,
            active_relays: stats.relays.active_relays,
            timestamp: unix_now(),
        }),
    )
}

/// Health ladder: an empty pool is an outage, a pool with no scored relays
/// still accepts events but cannot deliver well.
fn health_status(total_relays: usize, active_relays: usize) -> (&'static str, StatusCode) {
    if total_relays == 0 {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    } else if active_relays == 0 {
        ("degraded", StatusCode::OK)
    } else {
        ("healthy", StatusCode::OK)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
