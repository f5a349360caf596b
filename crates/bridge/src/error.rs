// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds for the bridge API, matching the error-handling design's
/// documented kinds (auth_invalid, bad_request, session_unresolved, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeError {
    AuthInvalid,
    BadRequest,
    SessionUnresolved,
    PeerDisconnected,
    PeerTimeout,
    AttachmentTooLarge,
    AttachmentProcessing,
    UpstreamError,
    CaptchaPending,
    Internal,
}

impl BridgeError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthInvalid => 401,
            Self::BadRequest => 400,
            Self::SessionUnresolved => 400,
            Self::PeerDisconnected => 503,
            Self::PeerTimeout => 503,
            Self::AttachmentTooLarge => 413,
            Self::AttachmentProcessing => 500,
            Self::UpstreamError => 500,
            Self::CaptchaPending => 503,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthInvalid => "AUTH_INVALID",
            Self::BadRequest => "BAD_REQUEST",
            Self::SessionUnresolved => "SESSION_UNRESOLVED",
            Self::PeerDisconnected => "PEER_DISCONNECTED",
            Self::PeerTimeout => "PEER_TIMEOUT",
            Self::AttachmentTooLarge => "ATTACHMENT_TOO_LARGE",
            Self::AttachmentProcessing => "ATTACHMENT_PROCESSING",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::CaptchaPending => "CAPTCHA_PENDING",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for BridgeError {}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
