// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded, TTL-expiring caches for the image pipeline (spec §3
//! `ImageBase64Cache` / `FileBedURLCache`). Backed by `moka`'s async cache,
//! which folds the original's approximate "sort-by-timestamp, trim a
//! quarter" eviction into a single native LRU+TTL policy per insert.

use std::time::Duration;

use moka::future::Cache;

use crate::config::defaults;

/// Keyed by upstream image URL; value is the rendered markdown data-URL.
#[derive(Clone)]
pub struct ImageBase64Cache {
    inner: Cache<String, String>,
}

impl ImageBase64Cache {
    pub fn new() -> Self {
        Self::with_capacity(defaults::IMAGE_CACHE_MAX_SIZE, defaults::IMAGE_CACHE_TTL_SECS)
    }

    pub fn with_capacity(max_capacity: u64, ttl_secs: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();
        Self { inner }
    }

    pub async fn get(&self, url: &str) -> Option<String> {
        self.inner.get(url).await
    }

    pub async fn insert(&self, url: String, markdown: String) {
        self.inner.insert(url, markdown).await;
    }

    pub async fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }
}

impl Default for ImageBase64Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed by SHA-256 of the base64 payload; value is the file-bed uploaded URL.
#[derive(Clone)]
pub struct FileBedUrlCache {
    inner: Cache<String, String>,
}

impl FileBedUrlCache {
    pub fn new() -> Self {
        Self::with_capacity(
            defaults::FILEBED_URL_CACHE_MAX_SIZE,
            defaults::FILEBED_URL_CACHE_TTL_SECS,
        )
    }

    pub fn with_capacity(max_capacity: u64, ttl_secs: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();
        Self { inner }
    }

    pub async fn get(&self, sha256_hex: &str) -> Option<String> {
        self.inner.get(sha256_hex).await
    }

    pub async fn insert(&self, sha256_hex: String, url: String) {
        self.inner.insert(sha256_hex, url).await;
    }

    /// Force pending TTL evictions to run and report the resulting size
    /// (spec §4.8 "expires FileBedURLCache entries past TTL").
    pub async fn expire_stale(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }
}

impl Default for FileBedUrlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
