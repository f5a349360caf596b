// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry & Recovery (spec §4.7): the pending queue a request parks in while
//! the peer is disconnected, and the reconnection-driven replay that drains
//! it (plus re-keys still-open in-flight requests onto the new connection).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::dispatch::{consume_non_stream, resolve_endpoint, send_to_peer};
use crate::error::BridgeError;
use crate::model_map::resolve_model_type;
use crate::openai::ChatCompletionRequest;
use crate::state::{AppState, InboundFragment, PendingRequest, RequestRecord};
use crate::translate::{translate, TranslateContext};

/// Park the current HTTP request in the pending queue and await its result,
/// bounded by `retry_timeout_seconds` (spec §4.2 step 5).
pub async fn await_reconnect(
    state: &AppState,
    openai_request: serde_json::Value,
    client_ip: String,
    user_agent: String,
    retry_timeout: Duration,
) -> Result<serde_json::Value, BridgeError> {
    let (responder, rx) = oneshot::channel();
    state.pending.push(PendingRequest { openai_request, original_request_id: None, responder, client_ip, user_agent }).await;

    match timeout(retry_timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(BridgeError::Internal),
        Err(_) => Err(BridgeError::PeerTimeout),
    }
}

/// Runs for the process lifetime: wakes on every peer (re)connection and
/// replays what accumulated while it was gone. Spawn once at startup.
pub async fn run_recovery_loop(state: Arc<AppState>) {
    loop {
        state.ws_hub.connected.notified().await;
        requeue_open_registry_entries(&state).await;
        replay_pending_queue(&state).await;
    }
}

/// Population 2 (spec §4.7 point 2): requests already dispatched before the
/// disconnect, whose event queue is still open because `enable_auto_retry`
/// kept it alive. Re-key each onto a fresh `requestId` and resend the
/// translated payload to the newly-connected peer; the original consumer
/// keeps reading the same queue, unaware its `requestId` changed underneath
/// it. Entries whose saved metadata can't be rebuilt get a "lost on
/// reconnect" terminal error instead.
async fn requeue_open_registry_entries(state: &Arc<AppState>) {
    for request_id in state.registry.snapshot_ids().await {
        let Some((queue_tx, record)) = state.registry.take_for_requeue(&request_id).await else { continue };
        if let Err(err) = rebuild_and_resend(state, queue_tx, record).await {
            tracing::warn!(request_id = %request_id, err = %err, "in-flight request lost on reconnect");
        }
    }
}

/// Rebuild an OpenAI-shaped request from a saved [`RequestRecord`], re-run
/// translation (file-bed uploads are idempotent via the URL cache), and
/// re-register the record's own queue sender under a new request id before
/// sending to the peer. The consumer still reading the old `requestId`'s
/// receiver is unaffected: it is the same channel, just filed under a new
/// key in the registry.
async fn rebuild_and_resend(
    state: &Arc<AppState>,
    queue_tx: tokio::sync::mpsc::Sender<InboundFragment>,
    record: RequestRecord,
) -> Result<(), BridgeError> {
    let request: ChatCompletionRequest =
        serde_json::from_value(record.messages_snapshot.clone()).map_err(|_| BridgeError::Internal)?;

    let endpoint = crate::model_map::EndpointMapping {
        session_id: record.session_id.clone(),
        message_id: record.message_id.clone(),
        mode: record.mode_override,
        battle_target: record.battle_target_override,
        model_type: Some(record.model_type),
    };

    let config = state.config_snapshot().await;
    let ctx = TranslateContext {
        config: &config,
        http_client: &state.http_client,
        disabled_endpoints: &state.disabled_endpoints,
        filebed_round_robin: &state.filebed_round_robin,
        filebed_cache: &state.filebed_cache,
    };
    let payload = translate(&request, &endpoint, record.model_type, &ctx).await?;

    let new_request_id = uuid::Uuid::new_v4().to_string();
    let new_record =
        RequestRecord { request_id: new_request_id.clone(), created_at: std::time::Instant::now(), ..record };
    state.registry.insert_with_sender(new_record, queue_tx).await;
    send_to_peer(state, &new_request_id, &payload).await;
    Ok(())
}

/// Population 1 (spec §4.7 point 1): requests that never made it past
/// dispatch before the disconnect. Fully dispatch each one now: resolve the
/// endpoint, translate, register, send, then collect the complete response
/// and hand it to the waiting `oneshot`. Since no client-facing stream
/// exists yet to write into, the collected result is always the fully
/// buffered JSON body, even for `stream:true` requests.
async fn replay_pending_queue(state: &Arc<AppState>) {
    for pending in state.pending.drain().await {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let result = dispatch_pending(&state, &pending.openai_request, &pending.client_ip, &pending.user_agent).await;
            let _ = pending.responder.send(result);
        });
    }
}

async fn dispatch_pending(
    state: &Arc<AppState>,
    openai_request: &serde_json::Value,
    client_ip: &str,
    user_agent: &str,
) -> Result<serde_json::Value, BridgeError> {
    let request: ChatCompletionRequest =
        serde_json::from_value(openai_request.clone()).map_err(|_| BridgeError::BadRequest)?;

    let config = state.config_snapshot().await;
    let endpoint_map = state.model_endpoint_map.read().await.clone();
    let model_map = state.model_map.read().await.clone();
    let model_type = resolve_model_type(&endpoint_map, &model_map, &request.model);
    let endpoint = resolve_endpoint(state, &config, &request.model).await?;

    let ctx = TranslateContext {
        config: &config,
        http_client: &state.http_client,
        disabled_endpoints: &state.disabled_endpoints,
        filebed_round_robin: &state.filebed_round_robin,
        filebed_cache: &state.filebed_cache,
    };
    let payload = translate(&request, &endpoint, model_type, &ctx).await?;

    let request_id = uuid::Uuid::new_v4().to_string();
    let record = RequestRecord {
        request_id: request_id.clone(),
        created_at: std::time::Instant::now(),
        model: request.model.clone(),
        model_type,
        stream: request.stream,
        messages_snapshot: openai_request.clone(),
        session_id: endpoint.session_id.clone(),
        message_id: endpoint.message_id.clone(),
        mode_override: endpoint.mode,
        battle_target_override: endpoint.battle_target,
        client_ip: client_ip.to_owned(),
        user_agent: user_agent.to_owned(),
        country: None,
        city: None,
        platform: String::new(),
    };
    let mut rx = state.registry.register(record).await;

    send_to_peer(state, &request_id, &payload).await;

    let response = consume_non_stream(state, &mut rx, &request, &request_id, &config).await;
    state.registry.remove(&request_id).await;
    response
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
