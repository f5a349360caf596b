// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token auth for the WebSocket upgrade and `/admin/*` routes
//! (spec §6 deployment note: per-request `/v1/*` auth is the
//! [`crate::external::TokenValidator`] seam, not this layer).

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::BridgeError;
use crate::state::AppState;

/// Constant-time string comparison to avoid a timing side-channel.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a `Bearer` token from HTTP headers. `None` expected token
/// disables this check entirely.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), BridgeError> {
    let expected = match expected {
        Some(tok) => tok,
        None => return Ok(()),
    };

    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(BridgeError::AuthInvalid)?;

    let token = header.strip_prefix("Bearer ").ok_or(BridgeError::AuthInvalid)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(BridgeError::AuthInvalid)
    }
}

/// Validate a token carried in a WebSocket upgrade query string (`?token=...`).
pub fn validate_ws_query(query: &str, expected: Option<&str>) -> Result<(), BridgeError> {
    let expected = match expected {
        Some(tok) => tok,
        None => return Ok(()),
    };

    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("token=") {
            if constant_time_eq(value, expected) {
                return Ok(());
            }
        }
    }

    Err(BridgeError::AuthInvalid)
}

/// Axum middleware guarding `/admin/*`. `/v1/*` and the WS upgrade path skip
/// this layer: `/v1/*` auth lives in `dispatch.rs`, WS auth is validated via
/// query param inside [`crate::transport::ws_hub::ws_handler`].
pub async fn auth_layer(state: State<Arc<AppState>>, req: Request<axum::body::Body>, next: Next) -> Response {
    let path = req.uri().path();

    if !path.starts_with("/admin/") {
        return next.run(req).await;
    }

    if let Err(err) = validate_bearer(req.headers(), state.admin_token.as_deref()) {
        return err.to_http_response("unauthorized").into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
