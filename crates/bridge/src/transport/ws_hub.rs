// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The downstream side of the WebSocket Hub (spec §4.1): the single fixed
//! upgrade path the browser peer connects to, and the per-connection
//! receive/send loop that binds it into [`crate::state::WsHub`].

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::state::{AppState, InboundFragment};
use crate::transport::auth;

/// Query parameters accepted on the WS upgrade.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// The inbound envelope the peer sends: `{requestId, data}` (spec §6).
#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "requestId")]
    request_id: String,
    data: InboundFragment,
}

/// `GET /ws` — single fixed-path WebSocket upgrade for the browser peer.
pub async fn ws_handler(State(state): State<Arc<AppState>>, Query(query): Query<WsQuery>, ws: WebSocketUpgrade) -> Response {
    let query_str = query.token.as_ref().map(|t| format!("token={t}")).unwrap_or_default();
    if let Err(err) = auth::validate_ws_query(&query_str, state.admin_token.as_deref()) {
        return err.to_http_response("unauthorized").into_response();
    }

    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

/// Per-connection handler: binds the peer into the Hub, serializes outbound
/// writes through a dedicated channel, and routes inbound frames into the
/// per-request event queues until the socket closes or the peer is replaced.
async fn handle_ws(state: Arc<AppState>, socket: WebSocket) {
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    state.ws_hub.bind(outbound_tx).await;
    tracing::info!("peer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            msg = outbound_rx.recv() => {
                match msg {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => route_inbound(&state, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.ws_hub.unbind().await;
    tracing::info!("peer disconnected");

    let config = state.config_snapshot().await;
    if !config.enable_auto_retry {
        let cleared = state.registry.clear_with_error("peer disconnected").await;
        if !cleared.is_empty() {
            tracing::warn!(count = cleared.len(), "cleared live queues on peer disconnect");
        }
    }
}

/// Parse one inbound WS text frame as `{requestId, data}` and route `data`
/// into the named request's event queue; log and drop anything that doesn't
/// parse or whose `requestId` is unknown (spec §4.1 "orphan").
async fn route_inbound(state: &AppState, text: &str) {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(err = %err, "failed to parse inbound peer frame");
            return;
        }
    };

    if !state.registry.route(&envelope.request_id, envelope.data).await {
        tracing::debug!(request_id = %envelope.request_id, "orphan frame: no such request");
    }
}

#[cfg(test)]
#[path = "ws_hub_tests.rs"]
mod tests;
