// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide configuration: CLI/env startup args plus the hot-reloadable
//! JSONC application config.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Constants carried over from the original implementation verbatim.
pub mod defaults {
    /// Seconds a disabled file-bed endpoint stays disabled before auto-recovery.
    pub const FILEBED_RECOVERY_TIME_SECS: u64 = 300;
    /// TTL (seconds) for the base64 image cache.
    pub const IMAGE_CACHE_TTL_SECS: u64 = 3600;
    /// TTL (seconds) for the file-bed uploaded-URL cache.
    pub const FILEBED_URL_CACHE_TTL_SECS: u64 = 300;
    /// Max entries held in the file-bed URL cache.
    pub const FILEBED_URL_CACHE_MAX_SIZE: u64 = 500;
    /// Max entries held in the base64 image cache.
    pub const IMAGE_CACHE_MAX_SIZE: u64 = 500;
    /// Default monitor loop cadence.
    pub const MONITOR_INTERVAL_SECS: u64 = 60;
}

/// Process-level startup configuration (CLI flags / env vars).
///
/// Everything that changes the application's *behavior* (bypass settings,
/// reasoning mode, retry policy, ...) lives in [`Config`] instead, which is
/// loaded from a JSONC file and can be hot-reloaded.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "arenabridge", about = "OpenAI-compatible bridge proxy")]
pub struct CliArgs {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "BRIDGE_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "BRIDGE_PORT")]
    pub port: u16,

    /// Path to the JSONC application config file.
    #[arg(long, default_value = "config.jsonc", env = "BRIDGE_CONFIG")]
    pub config: PathBuf,

    /// Path to the model endpoint map JSON file.
    #[arg(long, default_value = "model_endpoint_map.json", env = "BRIDGE_MODEL_MAP")]
    pub model_map: PathBuf,

    /// Path to the plain model-type map JSON file, used as a fallback when a
    /// model has no entry in `model_map`.
    #[arg(long, default_value = "models.json", env = "BRIDGE_MODELS")]
    pub models: PathBuf,

    /// Bearer token required on `/v1/*` requests. If unset, downstream auth
    /// is delegated entirely to the external token validator.
    #[arg(long, env = "BRIDGE_ADMIN_TOKEN")]
    pub admin_token: Option<String>,
}

/// `bypass_settings` per model type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BypassSettings {
    #[serde(default)]
    pub text: Option<bool>,
    #[serde(default)]
    pub image: Option<bool>,
    #[serde(default)]
    pub search: Option<bool>,
}

/// A single bypass-injection preset: the trailing message appended to evade
/// upstream content guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassPreset {
    pub role: String,
    pub content: String,
    #[serde(default = "default_participant_position")]
    pub participant_position: String,
}

fn default_participant_position() -> String {
    "a".to_owned()
}

impl Default for BypassPreset {
    fn default() -> Self {
        Self {
            role: "user".to_owned(),
            content: " ".to_owned(),
            participant_position: default_participant_position(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BypassInjection {
    #[serde(default)]
    pub active_preset: Option<String>,
    #[serde(default)]
    pub presets: std::collections::HashMap<String, BypassPreset>,
    #[serde(default)]
    pub custom: Option<BypassPreset>,
}

impl BypassInjection {
    /// Resolve the effective injected message: active preset, falling back
    /// to `custom`, falling back to the hardcoded default.
    pub fn resolve(&self) -> BypassPreset {
        if let Some(name) = &self.active_preset {
            if let Some(preset) = self.presets.get(name) {
                return preset.clone();
            }
        }
        self.custom.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdUpdaterMode {
    DirectChat,
    Battle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BattleTarget {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningOutputMode {
    Openai,
    ThinkTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileBedSelectionStrategy {
    Random,
    RoundRobin,
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageReturnMode {
    Url,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReturnFormat {
    #[serde(default = "default_image_mode")]
    pub mode: ImageReturnMode,
}

fn default_image_mode() -> ImageReturnMode {
    ImageReturnMode::Url
}

impl Default for ImageReturnFormat {
    fn default() -> Self {
        Self { mode: default_image_mode() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalSaveFormat {
    Original,
    Png,
    Jpeg,
    Webp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSaveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_local_save_format")]
    pub format: LocalSaveFormat,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_local_save_format() -> LocalSaveFormat {
    LocalSaveFormat::Original
}

fn default_jpeg_quality() -> u8 {
    85
}

impl Default for LocalSaveConfig {
    fn default() -> Self {
        Self { enabled: false, format: default_local_save_format(), jpeg_quality: default_jpeg_quality() }
    }
}

/// A single configured file-bed upload endpoint (spec §6 "File-bed outbound").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBedEndpoint {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub form_file_field: String,
    #[serde(default)]
    pub form_data_fields: std::collections::HashMap<String, String>,
    #[serde(default = "default_response_type")]
    pub response_type: FileBedResponseType,
    #[serde(default)]
    pub json_url_key: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileBedResponseType {
    Json,
    Text,
}

fn default_response_type() -> FileBedResponseType {
    FileBedResponseType::Json
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_pool_total")]
    pub total_limit: usize,
    #[serde(default = "default_pool_per_host")]
    pub per_host_limit: usize,
    #[serde(default = "default_dns_ttl")]
    pub dns_cache_ttl: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_timeout: u64,
}

fn default_pool_total() -> usize {
    100
}
fn default_pool_per_host() -> usize {
    32
}
fn default_dns_ttl() -> u64 {
    300
}
fn default_keepalive() -> u64 {
    90
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            total_limit: default_pool_total(),
            per_host_limit: default_pool_per_host(),
            dns_cache_ttl: default_dns_ttl(),
            keepalive_timeout: default_keepalive(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTimeoutConfig {
    #[serde(default = "default_total_timeout")]
    pub total: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    #[serde(default = "default_read_timeout")]
    pub sock_read: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_total_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    20
}
fn default_max_retries() -> u32 {
    2
}

impl Default for DownloadTimeoutConfig {
    fn default() -> Self {
        Self {
            total: default_total_timeout(),
            connect: default_connect_timeout(),
            sock_read: default_read_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_image_keep")]
    pub image_cache_keep_size: usize,
    #[serde(default = "default_url_history_keep")]
    pub url_history_keep: usize,
}

fn default_image_keep() -> usize {
    100
}
fn default_url_history_keep() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { image_cache_keep_size: default_image_keep(), url_history_keep: default_url_history_keep() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryManagement {
    #[serde(default = "default_gc_threshold")]
    pub gc_threshold_mb: u64,
    #[serde(default)]
    pub cache_config: CacheConfig,
}

fn default_gc_threshold() -> u64 {
    1024
}

impl Default for MemoryManagement {
    fn default() -> Self {
        Self { gc_threshold_mb: default_gc_threshold(), cache_config: CacheConfig::default() }
    }
}

/// Process-wide application configuration, loaded from a JSONC file and
/// swappable at runtime. See spec §3 "Config".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub session_id: String,
    pub message_id: String,
    #[serde(default)]
    pub tavern_mode_enabled: bool,
    #[serde(default)]
    pub bypass_enabled: bool,
    #[serde(default)]
    pub bypass_settings: BypassSettings,
    #[serde(default)]
    pub bypass_injection: BypassInjection,
    #[serde(default = "default_id_updater_mode")]
    pub id_updater_last_mode: IdUpdaterMode,
    #[serde(default = "default_battle_target")]
    pub id_updater_battle_target: BattleTarget,
    #[serde(default)]
    pub enable_auto_retry: bool,
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_seconds: u64,
    #[serde(default)]
    pub use_default_ids_if_mapping_not_found: bool,
    #[serde(default)]
    pub enable_lmarena_reasoning: bool,
    #[serde(default = "default_reasoning_mode")]
    pub reasoning_output_mode: ReasoningOutputMode,
    #[serde(default = "default_true")]
    pub preserve_streaming: bool,
    #[serde(default)]
    pub strip_reasoning_from_history: bool,
    #[serde(default)]
    pub file_bed_enabled: bool,
    #[serde(default)]
    pub file_bed_endpoints: Vec<FileBedEndpoint>,
    #[serde(default = "default_filebed_strategy")]
    pub file_bed_selection_strategy: FileBedSelectionStrategy,
    #[serde(default)]
    pub image_return_format: ImageReturnFormat,
    #[serde(default)]
    pub save_images_locally: bool,
    #[serde(default)]
    pub local_save_format: LocalSaveConfig,
    #[serde(default)]
    pub image_attachment_bypass_enabled: bool,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default)]
    pub download_timeout: DownloadTimeoutConfig,
    #[serde(default)]
    pub memory_management: MemoryManagement,
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_minutes: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream_response_timeout_seconds: u64,
}

fn default_id_updater_mode() -> IdUpdaterMode {
    IdUpdaterMode::DirectChat
}
fn default_battle_target() -> BattleTarget {
    BattleTarget::A
}
fn default_retry_timeout() -> u64 {
    30
}
fn default_reasoning_mode() -> ReasoningOutputMode {
    ReasoningOutputMode::Openai
}
fn default_filebed_strategy() -> FileBedSelectionStrategy {
    FileBedSelectionStrategy::Failover
}
fn default_max_concurrent_downloads() -> usize {
    8
}
fn default_metadata_timeout() -> u64 {
    30
}
fn default_stream_timeout() -> u64 {
    120
}

impl Config {
    /// Load from a JSONC (JSON-with-comments) file on disk.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        let config: Self = json5::from_str(&text)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn download_timeouts(&self) -> (std::time::Duration, std::time::Duration, std::time::Duration) {
        (
            std::time::Duration::from_secs(self.download_timeout.connect),
            std::time::Duration::from_secs(self.download_timeout.sock_read),
            std::time::Duration::from_secs(self.download_timeout.total),
        )
    }

    pub fn stream_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stream_response_timeout_seconds)
    }

    pub fn retry_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_timeout_seconds)
    }

    pub fn metadata_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.metadata_timeout_minutes * 60)
    }

    /// Resolve the effective bypass enablement for a given model type (spec §4.3 step 6).
    pub fn effective_bypass(&self, model_type: &str) -> bool {
        if !self.bypass_enabled {
            return false;
        }
        let per_type = match model_type {
            "image" => self.bypass_settings.image,
            "search" => self.bypass_settings.search,
            "text" => self.bypass_settings.text,
            _ => None,
        };
        match per_type {
            Some(v) => v,
            None => !matches!(model_type, "image" | "search"),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
