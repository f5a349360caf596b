// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Image Pipeline (spec §4.6): base64⇄URL conversion, file-bed upload with
//! failover, and bounded LRU+TTL caches.

pub mod cache;
pub mod download;
pub mod filebed;

use std::path::{Path, PathBuf};

use base64::Engine;

pub use cache::{FileBedUrlCache, ImageBase64Cache};
pub use download::{build_client, extension_for, reencode_for_local_save, DownloadedImage, Downloader};
pub use filebed::{upload_with_failover, DisabledEndpoints};

use crate::config::{Config, ImageReturnMode, LocalSaveConfig};

/// Render an upstream image URL into the markdown form the client sees,
/// honoring `image_return_format.mode`. In `base64` mode, a cache hit skips
/// redownload entirely; a miss downloads, encodes, caches, and degrades
/// gracefully to the URL form on failure.
pub async fn render_image_reference(
    url: &str,
    config: &Config,
    cache: &ImageBase64Cache,
    downloader: &Downloader,
    metrics: &crate::monitor::Metrics,
) -> String {
    match config.image_return_format.mode {
        ImageReturnMode::Url => format!("![Image]({url})"),
        ImageReturnMode::Base64 => {
            if let Some(markdown) = cache.get(url).await {
                metrics.record_image_cache(true);
                return markdown;
            }
            metrics.record_image_cache(false);
            let (_connect, _read, total) = config.download_timeouts();
            match downloader.download(url, total, config.download_timeout.max_retries).await {
                Ok(img) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&img.bytes);
                    let markdown = format!("![Image](data:{};base64,{encoded})", img.content_type);
                    cache.insert(url.to_owned(), markdown.clone()).await;
                    markdown
                }
                Err(e) => {
                    tracing::warn!(url, err = %e, "base64 image download failed, degrading to URL form");
                    format!("![Image]({url})")
                }
            }
        }
    }
}

/// Write a downloaded image to `downloaded_images/YYYYMMDD/` per spec §6
/// "Persisted state", after optionally re-encoding per `local_save_format`.
pub async fn save_locally(
    base_dir: &Path,
    request_id: &str,
    image: &DownloadedImage,
    local_save: &LocalSaveConfig,
) -> anyhow::Result<PathBuf> {
    let (bytes, content_type) = reencode_for_local_save(
        &image.bytes,
        &image.content_type,
        local_save.format,
        local_save.jpeg_quality,
    );
    let ext = extension_for(&content_type, local_save.format);

    let now = chrono::Local::now();
    let day_dir = base_dir.join(now.format("%Y%m%d").to_string());
    tokio::fs::create_dir_all(&day_dir).await?;

    let short_rid = &request_id[..request_id.len().min(8)];
    let file_name = format!("{}_{short_rid}.{ext}", now.format("%Y%m%d_%H%M%S_%3f"));
    let path = day_dir.join(file_name);
    tokio::fs::write(&path, &bytes).await?;
    Ok(path)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
