// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Internal `/admin/*` surface (spec §2 "not part of the public core
//! contract"): metrics readout and config hot-reload.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::config::Config;
use crate::model_map::{ModelEndpointMap, ModelMap};
use crate::error::BridgeError;
use crate::state::AppState;

/// `GET /admin/stats`: a snapshot of [`crate::monitor::Metrics`].
pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    Json(state.metrics.snapshot().await).into_response()
}

/// `POST /admin/config/reload`: re-read the JSONC config and model-map files
/// from their configured paths and atomically swap them in (spec §2.3).
pub async fn reload_config(State(state): State<Arc<AppState>>) -> Response {
    match reload(&state).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.to_http_response(err.to_string()).into_response(),
    }
}

async fn reload(state: &AppState) -> Result<(), BridgeError> {
    let config = Config::load(&state.config_path).map_err(|e| {
        tracing::error!(err = %e, "config reload failed");
        BridgeError::Internal
    })?;
    *state.config.write().await = Arc::new(config);

    if state.model_map_path.exists() {
        let endpoint_map = ModelEndpointMap::load(&state.model_map_path).map_err(|e| {
            tracing::error!(err = %e, "model endpoint map reload failed");
            BridgeError::Internal
        })?;
        *state.model_endpoint_map.write().await = Arc::new(endpoint_map);
    }

    if state.models_path.exists() {
        let model_map = ModelMap::load(&state.models_path).map_err(|e| {
            tracing::error!(err = %e, "model map reload failed");
            BridgeError::Internal
        })?;
        *state.model_map.write().await = Arc::new(model_map);
    }

    tracing::info!("config reloaded");
    Ok(())
}

#[cfg(test)]
#[path = "admin_tests.rs"]
mod tests;
