// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Housekeeping loop (spec §4.8): runs at a fixed cadence for the process
//! lifetime, grounded on `upstream::health::spawn_health_checker`'s
//! snapshot-then-act shape over `CancellationToken`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::defaults::MONITOR_INTERVAL_SECS;
use crate::state::AppState;

/// Cap on the in-memory recent-request ring (spec §9 "recent-request ring
/// buffer" from `modules/monitoring.py`).
const RECENT_REQUESTS_CAPACITY: usize = 100;

/// One entry in the recent-request ring.
#[derive(Debug, Clone, Serialize)]
pub struct RecentRequest {
    pub model: String,
    pub stream: bool,
    pub success: bool,
}

/// In-process counters supplementing `modules/monitoring.py`'s request and
/// cache-hit tracking (spec §9). Queried read-only via `GET /admin/stats`.
pub struct Metrics {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    image_cache_hits: AtomicU64,
    image_cache_misses: AtomicU64,
    filebed_cache_hits: AtomicU64,
    filebed_cache_misses: AtomicU64,
    recent: Mutex<VecDeque<RecentRequest>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            image_cache_hits: AtomicU64::new(0),
            image_cache_misses: AtomicU64::new(0),
            filebed_cache_hits: AtomicU64::new(0),
            filebed_cache_misses: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_REQUESTS_CAPACITY)),
        }
    }

    pub async fn record_request(&self, model: &str, stream: bool, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut recent = self.recent.lock().await;
        if recent.len() == RECENT_REQUESTS_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(RecentRequest { model: model.to_owned(), stream, success });
    }

    pub fn record_image_cache(&self, hit: bool) {
        if hit {
            self.image_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.image_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_filebed_cache(&self, hit: bool) {
        if hit {
            self.filebed_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.filebed_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            image_cache_hits: self.image_cache_hits.load(Ordering::Relaxed),
            image_cache_misses: self.image_cache_misses.load(Ordering::Relaxed),
            filebed_cache_hits: self.filebed_cache_hits.load(Ordering::Relaxed),
            filebed_cache_misses: self.filebed_cache_misses.load(Ordering::Relaxed),
            recent_requests: self.recent.lock().await.iter().cloned().collect(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON body for `GET /admin/stats`.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub image_cache_hits: u64,
    pub image_cache_misses: u64,
    pub filebed_cache_hits: u64,
    pub filebed_cache_misses: u64,
    pub recent_requests: Vec<RecentRequest>,
}

/// Spawn the housekeeping loop. Runs until `state.shutdown` is cancelled.
pub fn spawn(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            run_once(&state).await;
        }
    });
}

async fn run_once(state: &Arc<AppState>) {
    let remaining = state.filebed_cache.expire_stale().await;
    tracing::debug!(remaining, "file-bed URL cache TTL sweep");

    let config = state.config_snapshot().await;
    let reaped = state.registry.reap_older_than(config.metadata_timeout()).await;
    if !reaped.is_empty() {
        tracing::warn!(count = reaped.len(), "reaped stale request metadata on metadata timeout");
    }

    let recovery = Duration::from_secs(crate::config::defaults::FILEBED_RECOVERY_TIME_SECS);
    let recovered = state.disabled_endpoints.sweep_expired(recovery).await;
    for name in &recovered {
        tracing::info!(endpoint = %name, "file-bed endpoint auto-recovered");
    }

    maybe_trim_caches(state, &config).await;
}

/// Resident-memory sampling has no real collaborator in this core (spec §6
/// out-of-scope surfaces don't include one either); `ImageBase64Cache`
/// already bounds itself via moka's own max-capacity LRU on every insert, so
/// the threshold check here is a logging signal, not an enforcement path.
async fn maybe_trim_caches(state: &Arc<AppState>, config: &crate::config::Config) {
    let keep = config.memory_management.cache_config.image_cache_keep_size as u64;
    let count = state.image_cache.entry_count().await;
    if count > keep {
        tracing::debug!(
            entries = count,
            keep_size = keep,
            gc_threshold_mb = config.memory_management.gc_threshold_mb,
            "image cache above configured keep size; relying on moka's own LRU eviction"
        );
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
