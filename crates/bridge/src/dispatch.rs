// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher (spec §4.2): the `POST /v1/chat/completions` and `GET
//! /v1/models` handlers. Resolves the target endpoint, runs the payload
//! through the Translator, registers the request, hands it to the peer, and
//! assembles whichever response shape the client asked for.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::Config;
use crate::error::BridgeError;
use crate::external::token::UsageRecord;
use crate::external::Platform;
use crate::image_pipe::render_image_reference;
use crate::model_map::{resolve_model_type, EndpointBinding, EndpointMapping};
use crate::openai::{ChatCompletionRequest, ModelListEntry, ModelsResponse};
use crate::retry;
use crate::state::{AppState, InboundFragment, RequestRecord, EVENT_QUEUE_CAPACITY};
use crate::stream::{sse_response, NonStreamAssembler, ParsedEvent, StreamParser, StreamingAssembler};
use crate::translate::{translate, TranslateContext, TranslatedPayload};

/// `POST /v1/chat/completions`.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_owned();
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let result = handle_chat_completions(&state, addr, &headers, body).await;
    state.metrics.record_request(&model, stream, result.is_ok()).await;

    match result {
        Ok(response) => response,
        Err(err) => err.to_http_response(default_message(err)).into_response(),
    }
}

async fn handle_chat_completions(
    state: &Arc<AppState>,
    addr: SocketAddr,
    headers: &HeaderMap,
    body: serde_json::Value,
) -> Result<Response, BridgeError> {
    let token = bearer_token(headers).ok_or(BridgeError::AuthInvalid)?;
    let token_info = state.token_validator.validate(token).await?;

    let user_agent = user_agent_header(headers);
    let geo = state.geo_classifier.lookup(addr.ip());
    let platform = state.geo_classifier.classify(&user_agent);

    let config = state.config_snapshot().await;

    let request: ChatCompletionRequest = serde_json::from_value(body.clone()).map_err(|_| BridgeError::BadRequest)?;
    let endpoint_map = state.model_endpoint_map.read().await.clone();
    let model_map = state.model_map.read().await.clone();
    let model_type = resolve_model_type(&endpoint_map, &model_map, &request.model);
    let endpoint = resolve_endpoint(state, &config, &request.model).await?;

    if !state.ws_hub.is_connected().await {
        if !config.enable_auto_retry {
            return Err(BridgeError::PeerDisconnected);
        }
        let value = retry::await_reconnect(state, body, addr.ip().to_string(), user_agent, config.retry_timeout()).await?;
        return Ok(Json(value).into_response());
    }

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
        messages_snapshot: body,
        session_id: endpoint.session_id.clone(),
        message_id: endpoint.message_id.clone(),
        mode_override: endpoint.mode,
        battle_target_override: endpoint.battle_target,
        client_ip: addr.ip().to_string(),
        user_agent: user_agent.clone(),
        country: geo.country,
        city: geo.city,
        platform: platform_label(platform).to_owned(),
    };
    let mut rx = state.registry.register(record).await;
    send_to_peer(state, &request_id, &payload).await;

    if request.stream {
        let (sse_tx, sse_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tokio::spawn(run_stream(Arc::clone(state), rx, request_id, request.model.clone(), Arc::clone(&config), sse_tx));
        return Ok(sse_response(sse_rx));
    }

    let response = consume_non_stream(state, &mut rx, &request, &request_id, &config).await;
    state.registry.remove(&request_id).await;
    let value = response?;
    log_usage(state, &token_info.subject, &request.model, &value).await;
    Ok(Json(value).into_response())
}

/// `GET /v1/models`: derived from the endpoint map, falling back to the
/// plain model-type map, 404 if neither has any entries (spec §4.2).
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let endpoint_map = state.model_endpoint_map.read().await.clone();
    if !endpoint_map.is_empty() {
        let data = endpoint_map.0.keys().map(|id| model_entry(id)).collect();
        return Json(ModelsResponse { object: "list", data }).into_response();
    }

    let model_map = state.model_map.read().await.clone();
    if !model_map.0.is_empty() {
        let data = model_map.0.keys().map(|id| model_entry(id)).collect();
        return Json(ModelsResponse { object: "list", data }).into_response();
    }

    let body = serde_json::json!({ "error": { "code": "NOT_FOUND", "message": "no models configured" } });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

fn model_entry(id: &str) -> ModelListEntry {
    ModelListEntry { id: id.to_owned(), object: "model", created: 0, owned_by: "bridge".to_owned() }
}

/// Resolve the endpoint mapping for `model` (spec §4.2 step 3): a single
/// static mapping, round-robin among a list, the configured defaults if
/// `use_default_ids_if_mapping_not_found`, or a `BadRequest`. Shared between
/// the dispatcher and the reconnection-driven replay in [`crate::retry`].
pub async fn resolve_endpoint(state: &AppState, config: &Config, model: &str) -> Result<EndpointMapping, BridgeError> {
    let endpoint_map = state.model_endpoint_map.read().await.clone();
    match endpoint_map.0.get(model) {
        Some(EndpointBinding::Single(endpoint)) => Ok(endpoint.clone()),
        Some(EndpointBinding::List(list)) if !list.is_empty() => Ok(state.round_robin.pick(model, list).clone()),
        _ if config.use_default_ids_if_mapping_not_found => Ok(EndpointMapping {
            session_id: config.session_id.clone(),
            message_id: config.message_id.clone(),
            mode: None,
            battle_target: None,
            model_type: None,
        }),
        _ => Err(BridgeError::BadRequest),
    }
}

/// Send a translated payload to the bound peer, wrapped in the `{requestId,
/// payload}` envelope (spec §6). Shared with [`crate::retry`]'s replay paths.
pub(crate) async fn send_to_peer(state: &AppState, request_id: &str, payload: &TranslatedPayload) {
    let envelope = serde_json::json!({ "requestId": request_id, "payload": payload });
    if let Ok(text) = serde_json::to_string(&envelope) {
        state.ws_hub.send_text(text).await;
    }
}

/// Drain a request's event queue to completion (or timeout), returning the
/// fully-assembled non-stream JSON response. Shared with [`crate::retry`].
pub(crate) async fn consume_non_stream(
    state: &AppState,
    rx: &mut mpsc::Receiver<InboundFragment>,
    request: &ChatCompletionRequest,
    request_id: &str,
    config: &Config,
) -> Result<serde_json::Value, BridgeError> {
    let mut parser = StreamParser::new();
    let mut assembler = NonStreamAssembler::new();
    let stream_timeout = config.stream_timeout();

    loop {
        match timeout(stream_timeout, rx.recv()).await {
            Ok(Some(fragment)) => {
                let events = parser.feed(fragment);
                let mut done = false;
                for event in events {
                    done |= matches!(event, ParsedEvent::Done);
                    apply_non_stream_event(state, config, &mut assembler, event).await;
                }
                if done {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                for event in parser.flush() {
                    apply_non_stream_event(state, config, &mut assembler, event).await;
                }
                break;
            }
        }
    }

    let prompt_text: String =
        request.messages.iter().filter_map(|m| m.content.as_ref()).map(|c| c.text_only()).collect::<Vec<_>>().join("\n\n");
    let response = assembler.finish(request_id.to_owned(), request.model.clone(), &prompt_text, config.reasoning_output_mode, 0);
    serde_json::to_value(response).map_err(|_| BridgeError::Internal)
}

/// Render `Images` events into markdown before handing them to the
/// non-stream assembler; every other event passes through untouched. This is
/// the one place base64/URL image rendering (spec §4.6) actually happens for
/// a non-streamed response.
async fn apply_non_stream_event(state: &AppState, config: &Config, assembler: &mut NonStreamAssembler, event: ParsedEvent) {
    match event {
        ParsedEvent::Images(urls) => {
            let markdown = render_images_markdown(state, config, urls).await;
            assembler.apply(&ParsedEvent::Content(markdown));
        }
        ParsedEvent::CaptchaPending => {
            maybe_trigger_refresh(state).await;
            assembler.apply(&ParsedEvent::Error(CAPTCHA_MESSAGE.to_owned()));
        }
        other => assembler.apply(&other),
    }
}

/// Drive a request's event queue into SSE frames on `sse_tx` until `Done`,
/// the queue closes, or the client has gone away (`sse_tx.send` fails).
async fn run_stream(
    state: Arc<AppState>,
    mut rx: mpsc::Receiver<InboundFragment>,
    request_id: String,
    model: String,
    config: Arc<Config>,
    sse_tx: mpsc::Sender<String>,
) {
    let mut parser = StreamParser::new();
    let mut assembler = StreamingAssembler::new(request_id.clone(), model, config.reasoning_output_mode, config.preserve_streaming);
    let stream_timeout = config.stream_timeout();

    loop {
        match timeout(stream_timeout, rx.recv()).await {
            Ok(Some(fragment)) => {
                let events = parser.feed(fragment);
                let mut done = false;
                for event in events {
                    done |= matches!(event, ParsedEvent::Done);
                    if !forward_event(&state, &config, &mut assembler, event, &sse_tx).await {
                        done = true;
                        break;
                    }
                }
                if done {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                for event in parser.flush() {
                    let _ = forward_event(&state, &config, &mut assembler, event, &sse_tx).await;
                }
                break;
            }
        }
    }

    state.registry.remove(&request_id).await;
}

/// Render `Images` into markdown before applying, same as the non-stream
/// path. Returns `false` once the client has disconnected, so the caller
/// stops consuming and releases its queue entry (spec §5 "Cancellation").
async fn forward_event(
    state: &AppState,
    config: &Config,
    assembler: &mut StreamingAssembler,
    event: ParsedEvent,
    sse_tx: &mpsc::Sender<String>,
) -> bool {
    let frames = match event {
        ParsedEvent::Images(urls) => {
            let markdown = render_images_markdown(state, config, urls).await;
            assembler.apply(ParsedEvent::Content(markdown))
        }
        ParsedEvent::CaptchaPending => {
            maybe_trigger_refresh(state).await;
            assembler.apply(ParsedEvent::Error(CAPTCHA_MESSAGE.to_owned()))
        }
        other => assembler.apply(other),
    };
    for frame in frames {
        if sse_tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

const CAPTCHA_MESSAGE: &str = "upstream presented a verification challenge; requesting a session refresh";

/// Ask the bound peer to refresh its session once per challenge (spec §6
/// out-of-band `{command: "refresh"}`). [`crate::state::WsHub::bind`] clears
/// the flag on the next successful reconnection.
async fn maybe_trigger_refresh(state: &AppState) {
    if state.ws_hub.is_refreshing() {
        return;
    }
    state.ws_hub.mark_refreshing();
    if let Ok(text) = serde_json::to_string(&serde_json::json!({ "command": "refresh" })) {
        state.ws_hub.send_text(text).await;
    }
}

async fn render_images_markdown(state: &AppState, config: &Config, urls: Vec<String>) -> String {
    let mut rendered = Vec::with_capacity(urls.len());
    for url in urls {
        rendered.push(render_image_reference(&url, config, &state.image_cache, &state.downloader, &state.metrics).await);
    }
    rendered.join("\n")
}

async fn log_usage(state: &AppState, subject: &str, model: &str, response: &serde_json::Value) {
    let prompt_tokens = response.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
    let completion_tokens = response.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
    state
        .token_validator
        .log_usage(UsageRecord { subject: subject.to_owned(), model: model.to_owned(), prompt_tokens, completion_tokens })
        .await;
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

fn user_agent_header(headers: &HeaderMap) -> String {
    headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or("").to_owned()
}

fn platform_label(platform: Platform) -> &'static str {
    match platform {
        Platform::Desktop => "desktop",
        Platform::Mobile => "mobile",
        Platform::Bot => "bot",
        Platform::Unknown => "unknown",
    }
}

fn default_message(err: BridgeError) -> &'static str {
    match err {
        BridgeError::AuthInvalid => "invalid or missing bearer token",
        BridgeError::BadRequest => "model has no endpoint mapping and defaults are disabled",
        BridgeError::SessionUnresolved => "no session configured",
        BridgeError::PeerDisconnected => "no upstream peer connected",
        BridgeError::PeerTimeout => "timed out waiting for upstream peer to reconnect",
        BridgeError::AttachmentTooLarge => "attachment too large for upstream",
        BridgeError::AttachmentProcessing => "failed to process an attachment",
        BridgeError::UpstreamError => "upstream error",
        BridgeError::CaptchaPending => "upstream is behind a captcha challenge",
        BridgeError::Internal => "internal error",
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
