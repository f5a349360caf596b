// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport: router assembly for the public `/v1/*`
//! surface, the single-peer WS upgrade, and the internal `/admin/*` surface.

pub mod admin;
pub mod auth;
pub mod ws_hub;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::dispatch;
use crate::state::AppState;

/// Build the axum `Router` with every route and middleware layer.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(dispatch::chat_completions))
        .route("/v1/models", get(dispatch::list_models))
        .route("/ws", get(ws_hub::ws_handler))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/config/reload", post(admin::reload_config))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
