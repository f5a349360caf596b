// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token validation and usage logging. The real user/token database and its
//! JWT-backed admin dashboard are out of scope; the core only needs
//! `validate(token) -> TokenInfo` and `logUsage(...)`.

use async_trait::async_trait;

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub subject: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub subject: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<TokenInfo, BridgeError>;
    async fn log_usage(&self, usage: UsageRecord);
}

/// In-memory allow-list validator. Every non-empty bearer token is accepted
/// as its own subject; this exists only so the core is testable without a
/// real token database.
#[derive(Debug, Default)]
pub struct InMemoryTokenValidator {
    allow_list: Option<Vec<String>>,
}

impl InMemoryTokenValidator {
    pub fn new(allow_list: Option<Vec<String>>) -> Self {
        Self { allow_list }
    }
}

#[async_trait]
impl TokenValidator for InMemoryTokenValidator {
    async fn validate(&self, token: &str) -> Result<TokenInfo, BridgeError> {
        if token.is_empty() {
            return Err(BridgeError::AuthInvalid);
        }
        if let Some(allowed) = &self.allow_list {
            if !allowed.iter().any(|t| t == token) {
                return Err(BridgeError::AuthInvalid);
            }
        }
        Ok(TokenInfo { subject: token.to_owned(), label: None })
    }

    async fn log_usage(&self, usage: UsageRecord) {
        tracing::debug!(
            subject = %usage.subject,
            model = %usage.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "usage recorded"
        );
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
