// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Throttled image download with retries, and the optional local-save
//! re-encode transform (spec §4.6). The shared `reqwest::Client` is built
//! once, mirroring `UpstreamClient::new`'s `Client::builder()...build()`
//! shape, generalized with the connection-pool knobs from `Config`.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::ImageFormat;
use tokio::sync::Semaphore;

use crate::config::{Config, LocalSaveFormat};

/// Build the shared download client from `Config.connection_pool`.
///
/// TLS verification is disabled per spec §4.6 (the upstream image URLs are
/// attacker-adjacent browser-served content, not a service we authenticate
/// to); `sock_read` has no direct reqwest equivalent and is folded into the
/// per-request `total` timeout (see DESIGN.md).
pub fn build_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    let pool = &config.connection_pool;
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(pool.per_host_limit)
        .pool_idle_timeout(Duration::from_secs(pool.keepalive_timeout))
        .connect_timeout(Duration::from_secs(config.download_timeout.connect))
        .build()?;
    Ok(client)
}

pub struct Downloader {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

pub struct DownloadedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl Downloader {
    pub fn new(client: reqwest::Client, max_concurrent: usize) -> Self {
        Self { client, semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }

    /// Download `url`, retrying up to `max_retries` times with a short
    /// backoff (1s, then 2s, ...), bounded by the download semaphore.
    pub async fn download(
        &self,
        url: &str,
        total_timeout: Duration,
        max_retries: u32,
    ) -> anyhow::Result<DownloadedImage> {
        let _permit = self.semaphore.acquire().await?;

        let mut attempt = 0;
        loop {
            match self.try_once(url, total_timeout).await {
                Ok(img) => return Ok(img),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_secs(attempt as u64);
                    tracing::warn!(url, attempt, err = %e, "image download failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_once(&self, url: &str, total_timeout: Duration) -> anyhow::Result<DownloadedImage> {
        let response =
            tokio::time::timeout(total_timeout, self.client.get(url).send()).await??.error_for_status()?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_owned();
        let bytes = tokio::time::timeout(total_timeout, response.bytes()).await??.to_vec();
        Ok(DownloadedImage { bytes, content_type })
    }
}

/// Re-encode raw image bytes per `local_save_format`. Falls back to the
/// original bytes (and content type) on any decode/encode failure.
pub fn reencode_for_local_save(
    bytes: &[u8],
    original_content_type: &str,
    format: LocalSaveFormat,
    jpeg_quality: u8,
) -> (Vec<u8>, String) {
    let target = match format {
        LocalSaveFormat::Original => return (bytes.to_vec(), original_content_type.to_owned()),
        LocalSaveFormat::Png => ImageFormat::Png,
        LocalSaveFormat::Jpeg => ImageFormat::Jpeg,
        LocalSaveFormat::Webp => ImageFormat::WebP,
    };

    let decoded = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(_) => return (bytes.to_vec(), original_content_type.to_owned()),
    };

    let mut out = Cursor::new(Vec::new());
    let encode_result = match target {
        ImageFormat::Jpeg => {
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, jpeg_quality);
            decoded.write_with_encoder(encoder)
        }
        _ => decoded.write_to(&mut out, target),
    };

    match encode_result {
        Ok(()) => (out.into_inner(), target.to_mime_type().to_owned()),
        Err(_) => (bytes.to_vec(), original_content_type.to_owned()),
    }
}

/// Extension used for the `downloaded_images/...<ext>` filename (spec §6
/// "Persisted state").
pub fn extension_for(content_type: &str, format: LocalSaveFormat) -> &'static str {
    match format {
        LocalSaveFormat::Png => "png",
        LocalSaveFormat::Jpeg => "jpg",
        LocalSaveFormat::Webp => "webp",
        LocalSaveFormat::Original => {
            if content_type.contains("png") {
                "png"
            } else if content_type.contains("webp") {
                "webp"
            } else if content_type.contains("gif") {
                "gif"
            } else {
                "jpg"
            }
        }
    }
}

#[cfg(test)]
#[path = "download_tests.rs"]
mod tests;
