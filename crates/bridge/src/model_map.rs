// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Model → endpoint mapping and the round-robin index used to pick among
//! multiple endpoints mapped to the same model name.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::{BattleTarget, IdUpdaterMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Text,
    Image,
    Search,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Search => "search",
        }
    }
}

impl Default for ModelType {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub model_type: ModelType,
}

/// `{ sessionId, messageId, mode?, battleTarget?, type? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointMapping {
    pub session_id: String,
    pub message_id: String,
    #[serde(default)]
    pub mode: Option<IdUpdaterMode>,
    #[serde(default)]
    pub battle_target: Option<BattleTarget>,
    #[serde(rename = "type", default)]
    pub model_type: Option<ModelType>,
}

/// A model name may map to a single static endpoint or a list (round-robin).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointBinding {
    Single(EndpointMapping),
    List(Vec<EndpointMapping>),
}

/// `name -> EndpointMapping | [EndpointMapping, ...]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelEndpointMap(pub HashMap<String, EndpointBinding>);

/// Plain model → model-type map, used only as a fallback when a model has
/// no endpoint mapping entry (spec §4.2 step 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMap(pub HashMap<String, ModelEntry>);

impl ModelMap {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read model map {}: {e}", path.display()))?;
        let parsed: Self = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("failed to parse model map {}: {e}", path.display()))?;
        Ok(parsed)
    }
}

impl ModelEndpointMap {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read model map {}: {e}", path.display()))?;
        let parsed: Self = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("failed to parse model map {}: {e}", path.display()))?;
        Ok(parsed)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn model_names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

/// Thread-safe round-robin counters, one `u64` per model name.
///
/// Matches spec §3's `RoundRobinIndex: modelName -> uint`, "protected by a
/// lock; incremented atomically per selection".
#[derive(Default)]
pub struct RoundRobinIndex {
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobinIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next endpoint from `endpoints` for `model`, advancing the
    /// stored index modulo `endpoints.len()`.
    pub fn pick<'a>(&self, model: &str, endpoints: &'a [EndpointMapping]) -> &'a EndpointMapping {
        debug_assert!(!endpoints.is_empty());
        let len = endpoints.len();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let idx = counters.entry(model.to_owned()).or_insert(0);
        let chosen = *idx % len;
        *idx = (*idx + 1) % len;
        &endpoints[chosen]
    }

    #[cfg(test)]
    pub fn current(&self, model: &str) -> usize {
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).get(model).copied().unwrap_or(0)
    }
}

/// Resolve the model type for `model` (spec §4.2 step 3): prefer the
/// endpoint map's own per-entry `type` if present (checking the first entry
/// when the binding is a list), else fall back to the plain `model_map`,
/// else `text`.
pub fn resolve_model_type(endpoint_map: &ModelEndpointMap, model_map: &ModelMap, model: &str) -> ModelType {
    let from_endpoint_map = match endpoint_map.0.get(model) {
        Some(EndpointBinding::Single(entry)) => entry.model_type,
        Some(EndpointBinding::List(list)) => list.first().and_then(|entry| entry.model_type),
        None => None,
    };

    from_endpoint_map.or_else(|| model_map.0.get(model).map(|e| e.model_type)).unwrap_or_default()
}

#[cfg(test)]
#[path = "model_map_tests.rs"]
mod tests;
