// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-bed upload with per-endpoint failover (spec §4.3 step 8, §4.6).
//!
//! The file-bed HTTP endpoints themselves are real external collaborators
//! (not a trait seam, per spec §6.1): the core speaks `multipart/form-data`
//! to them directly with `reqwest::multipart`, grounded on
//! `upstream::client::UpstreamClient`'s request-building shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use crate::config::{Config, FileBedEndpoint, FileBedResponseType, FileBedSelectionStrategy};
use crate::error::BridgeError;

/// `endpointName -> disabledAt`. Entries older than `FILEBED_RECOVERY_TIME`
/// are removed lazily on lookup and swept by the monitor loop.
#[derive(Default)]
pub struct DisabledEndpoints {
    inner: RwLock<HashMap<String, Instant>>,
}

impl DisabledEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn disable(&self, name: &str) {
        self.inner.write().await.insert(name.to_owned(), Instant::now());
        tracing::warn!(endpoint = %name, "file-bed endpoint disabled");
    }

    pub async fn is_disabled(&self, name: &str, recovery: Duration) -> bool {
        let mut guard = self.inner.write().await;
        match guard.get(name) {
            Some(at) if at.elapsed() >= recovery => {
                guard.remove(name);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Remove every entry whose disable timestamp is at least `recovery` old.
    /// Called by the monitor loop (spec §4.8).
    pub async fn sweep_expired(&self, recovery: Duration) -> Vec<String> {
        let mut guard = self.inner.write().await;
        let expired: Vec<String> = guard
            .iter()
            .filter(|(_, at)| at.elapsed() >= recovery)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            guard.remove(name);
        }
        expired
    }
}

/// Order endpoints for one upload attempt per the configured strategy.
fn order_candidates<'a>(
    endpoints: &'a [FileBedEndpoint],
    strategy: FileBedSelectionStrategy,
    round_robin: &AtomicUsize,
) -> Vec<&'a FileBedEndpoint> {
    let mut candidates: Vec<&FileBedEndpoint> = endpoints.iter().filter(|e| e.enabled).collect();
    match strategy {
        FileBedSelectionStrategy::Failover => {}
        FileBedSelectionStrategy::Random => {
            candidates.shuffle(&mut rand::rng());
        }
        FileBedSelectionStrategy::RoundRobin => {
            if !candidates.is_empty() {
                let start = round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.rotate_left(start);
            }
        }
    }
    candidates
}

/// Try every enabled, non-disabled endpoint in strategy order until one
/// accepts the upload; disable failing endpoints as we go.
pub async fn upload_with_failover(
    client: &reqwest::Client,
    config: &Config,
    disabled: &DisabledEndpoints,
    round_robin: &AtomicUsize,
    file_name: &str,
    content_type: &str,
    bytes: Vec<u8>,
) -> Result<String, BridgeError> {
    let recovery = Duration::from_secs(crate::config::defaults::FILEBED_RECOVERY_TIME_SECS);
    let ordered = order_candidates(&config.file_bed_endpoints, config.file_bed_selection_strategy, round_robin);

    for endpoint in ordered {
        if disabled.is_disabled(&endpoint.name, recovery).await {
            continue;
        }
        match upload_one(client, endpoint, file_name, content_type, bytes.clone()).await {
            Ok(url) => return Ok(url),
            Err(e) => {
                tracing::warn!(endpoint = %endpoint.name, err = %e, "file-bed upload failed");
                disabled.disable(&endpoint.name).await;
            }
        }
    }

    Err(BridgeError::AttachmentProcessing)
}

async fn upload_one(
    client: &reqwest::Client,
    endpoint: &FileBedEndpoint,
    file_name: &str,
    content_type: &str,
    bytes: Vec<u8>,
) -> anyhow::Result<String> {
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(file_name.to_owned())
        .mime_str(content_type)
        .unwrap_or_else(|_| reqwest::multipart::Part::bytes(Vec::new()));

    let mut form = reqwest::multipart::Form::new().part(endpoint.form_file_field.clone(), part);
    for (key, value) in &endpoint.form_data_fields {
        form = form.text(key.clone(), value.clone());
    }
    if let (Some(key), Some(field)) = (&endpoint.api_key, &endpoint.api_key_field) {
        form = form.text(field.clone(), key.clone());
    }

    let mut request = client.post(&endpoint.url).multipart(form);
    if let (Some(key), None) = (&endpoint.api_key, &endpoint.api_key_field) {
        request = request.bearer_auth(key);
    }

    let response = request.send().await?.error_for_status()?;
    let headers = response.headers().clone();
    let body = response.text().await?;

    parse_upload_response(endpoint, &headers, &body)
        .ok_or_else(|| anyhow::anyhow!("file-bed response had no recognisable URL"))
}

fn parse_upload_response(
    endpoint: &FileBedEndpoint,
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> Option<String> {
    if let Some(location) = headers.get(reqwest::header::LOCATION).and_then(|v| v.to_str().ok()) {
        return Some(location.to_owned());
    }

    match endpoint.response_type {
        FileBedResponseType::Json => {
            let value: serde_json::Value = serde_json::from_str(body).ok()?;
            let key = endpoint.json_url_key.as_deref().unwrap_or("url");
            value.get(key)?.as_str().map(str::to_owned)
        }
        FileBedResponseType::Text => {
            let trimmed = body.trim();
            let candidate = trimmed.strip_prefix("wget ").unwrap_or(trimmed);
            if candidate.starts_with("http://") || candidate.starts_with("https://") {
                Some(candidate.to_owned())
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "filebed_tests.rs"]
mod tests;
