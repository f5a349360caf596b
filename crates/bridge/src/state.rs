// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared application state (spec §3 "RequestRegistry", "PendingRequest",
//! the single-peer WebSocket hub). Organized into focused sub-structs by
//! concern, the caches and HTTP plumbing live in [`crate::image_pipe`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{BattleTarget, Config, IdUpdaterMode};
use crate::external::{GeoClassifier, TokenValidator};
use crate::image_pipe::{Downloader, FileBedUrlCache, ImageBase64Cache};
use crate::model_map::{ModelEndpointMap, ModelMap, ModelType, RoundRobinIndex};

/// Raw fragment routed from the WS peer into a request's event queue, per
/// the WebSocket wire shape in spec §6: `data: string | list<string> |
/// {error} | {retry_info}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum InboundFragment {
    Text(String),
    List(Vec<String>),
    Error { error: String },
    RetryInfo { retry_info: RetryInfo },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryInfo {
    pub attempt: u32,
    pub max_attempts: u32,
    pub reason: String,
    pub delay: f64,
}

/// Capacity of a single request's bounded fragment queue (spec §5
/// "Backpressure").
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Bookkeeping for one in-flight HTTP request (spec §3 `RequestRecord`).
pub struct RequestRecord {
    pub request_id: String,
    pub created_at: Instant,
    pub model: String,
    pub model_type: ModelType,
    pub stream: bool,
    pub messages_snapshot: serde_json::Value,
    pub session_id: String,
    pub message_id: String,
    pub mode_override: Option<IdUpdaterMode>,
    pub battle_target_override: Option<BattleTarget>,
    pub client_ip: String,
    pub user_agent: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub platform: String,
}

/// A registry entry bundles a request's queue sender with its metadata so
/// both halves of spec §3 invariant (a) are created and removed together.
struct RegistryEntry {
    queue_tx: mpsc::Sender<InboundFragment>,
    record: RequestRecord,
}

/// `requestId -> (eventQueue, RequestRecord)` (spec §3 `RequestRegistry`).
#[derive(Default)]
pub struct RequestRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight request, creating its bounded event queue.
    pub async fn register(&self, record: RequestRecord) -> mpsc::Receiver<InboundFragment> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let request_id = record.request_id.clone();
        self.entries.write().await.insert(request_id, RegistryEntry { queue_tx: tx, record });
        rx
    }

    /// Route a fragment to the queue for `request_id`. Returns `false` (an
    /// "orphan") if no such request is registered (spec §8 invariant 1).
    pub async fn route(&self, request_id: &str, fragment: InboundFragment) -> bool {
        let guard = self.entries.read().await;
        match guard.get(request_id) {
            Some(entry) => entry.queue_tx.send(fragment).await.is_ok(),
            None => false,
        }
    }

    /// Remove and return the record for `request_id` (spec §8 invariant 2:
    /// removed exactly once on stream termination).
    pub async fn remove(&self, request_id: &str) -> Option<RequestRecord> {
        self.entries.write().await.remove(request_id).map(|entry| entry.record)
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.entries.read().await.contains_key(request_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Snapshot of every currently-registered request id.
    pub async fn snapshot_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Remove an entry and return its live queue sender alongside the saved
    /// record, for Recovery's in-place re-keying onto a new `requestId`
    /// (spec §4.7 point 2). Unlike [`Self::remove`], the queue itself
    /// survives — its receiver is still owned by the original consumer.
    pub async fn take_for_requeue(&self, request_id: &str) -> Option<(mpsc::Sender<InboundFragment>, RequestRecord)> {
        self.entries.write().await.remove(request_id).map(|entry| (entry.queue_tx, entry.record))
    }

    /// Re-insert a record, reusing an existing queue sender instead of
    /// creating a fresh channel. Used alongside [`Self::take_for_requeue`].
    pub async fn insert_with_sender(&self, record: RequestRecord, queue_tx: mpsc::Sender<InboundFragment>) {
        let request_id = record.request_id.clone();
        self.entries.write().await.insert(request_id, RegistryEntry { queue_tx, record });
    }

    /// Remove every entry whose `created_at` is older than `max_age`, sending
    /// a terminal "metadata timeout" error into each one's still-open queue
    /// before dropping the sender (spec §4.8). Returns the reaped IDs.
    pub async fn reap_older_than(&self, max_age: std::time::Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<(String, mpsc::Sender<InboundFragment>)> = {
            let mut guard = self.entries.write().await;
            let stale_ids: Vec<String> = guard
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.record.created_at) > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            stale_ids.into_iter().filter_map(|id| guard.remove(&id).map(|entry| (id, entry.queue_tx))).collect()
        };

        for (_, tx) in &stale {
            let _ = tx.try_send(InboundFragment::Error { error: "metadata timeout".to_owned() });
        }
        stale.into_iter().map(|(id, _)| id).collect()
    }

    /// Remove every entry, sending a terminal error into each one's still-open
    /// queue first (spec §4.1: peer disconnect without `enable_auto_retry`).
    pub async fn clear_with_error(&self, error: &str) -> Vec<String> {
        let drained: Vec<(String, mpsc::Sender<InboundFragment>)> =
            self.entries.write().await.drain().map(|(id, entry)| (id, entry.queue_tx)).collect();
        for (_, tx) in &drained {
            let _ = tx.try_send(InboundFragment::Error { error: error.to_owned() });
        }
        drained.into_iter().map(|(id, _)| id).collect()
    }
}

/// A request parked while the WS peer is disconnected (spec §3
/// `PendingRequest`, §4.7 Retry & Recovery).
pub struct PendingRequest {
    pub openai_request: serde_json::Value,
    pub original_request_id: Option<String>,
    pub responder: oneshot::Sender<Result<serde_json::Value, crate::error::BridgeError>>,
    pub client_ip: String,
    pub user_agent: String,
}

/// FIFO queue of requests awaiting peer reconnection.
#[derive(Default)]
pub struct PendingQueue {
    queue: Mutex<VecDeque<PendingRequest>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, request: PendingRequest) {
        self.queue.lock().await.push_back(request);
    }

    pub async fn drain(&self) -> Vec<PendingRequest> {
        self.queue.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

/// Single-peer WebSocket hub (spec §4.1). Only one peer is held at a time;
/// a new upgrade atomically replaces (and closes) the previous one.
pub struct WsHub {
    peer_tx: RwLock<Option<mpsc::UnboundedSender<String>>>,
    /// Set while a `refresh` command is outstanding for a captcha challenge;
    /// cleared on every new upgrade.
    refreshing_for_verification: AtomicBool,
    /// Notified whenever a new peer successfully connects, so the recovery
    /// layer can replay pending/orphaned requests.
    pub connected: Notify,
}

impl Default for WsHub {
    fn default() -> Self {
        Self {
            peer_tx: RwLock::new(None),
            refreshing_for_verification: AtomicBool::new(false),
            connected: Notify::new(),
        }
    }
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a newly-upgraded peer, replacing (and dropping, which closes)
    /// any previous one. Clears the refreshing-for-verification flag.
    pub async fn bind(&self, tx: mpsc::UnboundedSender<String>) {
        *self.peer_tx.write().await = Some(tx);
        self.refreshing_for_verification.store(false, Ordering::Release);
        self.connected.notify_waiters();
    }

    /// Clear the peer reference if it is still the one that disconnected.
    pub async fn unbind(&self) {
        *self.peer_tx.write().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.peer_tx.read().await.is_some()
    }

    /// Serialized write to the bound peer; `false` if no peer is bound or
    /// the channel is closed.
    pub async fn send_text(&self, msg: String) -> bool {
        match self.peer_tx.read().await.as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    pub fn mark_refreshing(&self) {
        self.refreshing_for_verification.store(true, Ordering::Release);
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing_for_verification.load(Ordering::Acquire)
    }
}

/// Top-level application state, handed to every HTTP/WS handler via axum's
/// `State` extractor.
pub struct AppState {
    /// Hot-reloadable config snapshot; readers clone the `Arc` so a reload
    /// never exposes a torn read (spec §2.3).
    pub config: RwLock<Arc<Config>>,
    pub config_path: PathBuf,
    /// Path to `model_endpoint_map.json` (`ModelEndpointMap`).
    pub model_map_path: PathBuf,
    /// Path to `models.json` (the plain `ModelMap` fallback).
    pub models_path: PathBuf,
    pub model_endpoint_map: RwLock<Arc<ModelEndpointMap>>,
    pub model_map: RwLock<Arc<ModelMap>>,
    pub round_robin: RoundRobinIndex,

    pub registry: RequestRegistry,
    pub pending: PendingQueue,
    pub ws_hub: WsHub,

    pub image_cache: ImageBase64Cache,
    pub filebed_cache: FileBedUrlCache,
    pub disabled_endpoints: crate::image_pipe::DisabledEndpoints,
    pub filebed_round_robin: AtomicUsize,
    pub downloader: Downloader,
    pub http_client: reqwest::Client,

    pub token_validator: Arc<dyn TokenValidator>,
    pub geo_classifier: Arc<dyn GeoClassifier>,

    /// Bearer token guarding the WS upgrade and `/admin/*` routes. `None`
    /// disables that layer of auth entirely (spec §6 deployment note: the
    /// per-request `TokenValidator` is the real auth boundary for `/v1/*`).
    pub admin_token: Option<String>,

    /// In-process request/cache counters (spec §9), queried via `GET
    /// /admin/stats`.
    pub metrics: crate::monitor::Metrics,

    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn config_snapshot(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
