// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::AtomicUsize;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::{
    BypassInjection, BypassSettings, CacheConfig, Config, ConnectionPoolConfig, DownloadTimeoutConfig,
    FileBedSelectionStrategy, ImageReturnFormat, LocalSaveConfig, MemoryManagement, ReasoningOutputMode,
};
use crate::external::{InMemoryTokenValidator, NaiveGeoClassifier};
use crate::image_pipe::{DisabledEndpoints, Downloader, FileBedUrlCache, ImageBase64Cache};
use crate::model_map::{ModelEndpointMap, ModelMap, ModelType, RoundRobinIndex};
use crate::state::{PendingQueue, RequestRecord, RequestRegistry, WsHub};

fn test_config(enable_auto_retry: bool) -> Config {
    Config {
        session_id: "s".to_owned(),
        message_id: "m".to_owned(),
        tavern_mode_enabled: false,
        bypass_enabled: false,
        bypass_settings: BypassSettings::default(),
        bypass_injection: BypassInjection::default(),
        id_updater_last_mode: crate::config::IdUpdaterMode::DirectChat,
        id_updater_battle_target: crate::config::BattleTarget::A,
        enable_auto_retry,
        retry_timeout_seconds: 30,
        use_default_ids_if_mapping_not_found: true,
        enable_lmarena_reasoning: false,
        reasoning_output_mode: ReasoningOutputMode::Openai,
        preserve_streaming: true,
        strip_reasoning_from_history: false,
        file_bed_enabled: false,
        file_bed_endpoints: Vec::new(),
        file_bed_selection_strategy: FileBedSelectionStrategy::Failover,
        image_return_format: ImageReturnFormat::default(),
        save_images_locally: false,
        local_save_format: LocalSaveConfig::default(),
        image_attachment_bypass_enabled: false,
        max_concurrent_downloads: 4,
        connection_pool: ConnectionPoolConfig::default(),
        download_timeout: DownloadTimeoutConfig::default(),
        memory_management: MemoryManagement::default(),
        metadata_timeout_minutes: 30,
        stream_response_timeout_seconds: 1,
    }
}

fn test_state(config: Config, admin_token: Option<String>) -> Arc<AppState> {
    let http_client = reqwest::Client::new();
    Arc::new(AppState {
        config: tokio::sync::RwLock::new(Arc::new(config)),
        config_path: "config.jsonc".into(),
        model_map_path: "model_endpoint_map.json".into(),
        models_path: "models.json".into(),
        model_endpoint_map: tokio::sync::RwLock::new(Arc::new(ModelEndpointMap::default())),
        model_map: tokio::sync::RwLock::new(Arc::new(ModelMap::default())),
        round_robin: RoundRobinIndex::new(),
        registry: RequestRegistry::new(),
        pending: PendingQueue::new(),
        ws_hub: WsHub::new(),
        image_cache: ImageBase64Cache::new(),
        filebed_cache: FileBedUrlCache::new(),
        disabled_endpoints: DisabledEndpoints::new(),
        filebed_round_robin: AtomicUsize::new(0),
        downloader: Downloader::new(http_client.clone(), 4),
        http_client,
        token_validator: Arc::new(InMemoryTokenValidator::new(None)),
        geo_classifier: Arc::new(NaiveGeoClassifier),
        admin_token,
        metrics: crate::monitor::Metrics::new(),
        shutdown: CancellationToken::new(),
    })
}

fn sample_record(request_id: &str) -> RequestRecord {
    RequestRecord {
        request_id: request_id.to_owned(),
        created_at: std::time::Instant::now(),
        model: "gpt-4".to_owned(),
        model_type: ModelType::Text,
        stream: false,
        messages_snapshot: serde_json::json!([]),
        session_id: "s".to_owned(),
        message_id: "m".to_owned(),
        mode_override: None,
        battle_target_override: None,
        client_ip: "127.0.0.1".to_owned(),
        user_agent: "ua".to_owned(),
        country: None,
        city: None,
        platform: String::new(),
    }
}

#[tokio::test]
async fn route_inbound_delivers_text_fragment_to_registered_queue() {
    let state = test_state(test_config(true), None);
    let mut rx = state.registry.register(sample_record("req-1")).await;

    route_inbound(&state, r#"{"requestId":"req-1","data":"a0:\"hi\"\n"}"#).await;

    let fragment = rx.recv().await.unwrap();
    assert!(matches!(fragment, InboundFragment::Text(t) if t.contains("hi")));
}

#[tokio::test]
async fn route_inbound_drops_unknown_request_id_without_panicking() {
    let state = test_state(test_config(true), None);
    route_inbound(&state, r#"{"requestId":"no-such-request","data":"a0:\"hi\"\n"}"#).await;
}

#[tokio::test]
async fn route_inbound_ignores_unparsable_frame() {
    let state = test_state(test_config(true), None);
    route_inbound(&state, "not json").await;
}

#[test]
fn validate_ws_query_rejects_wrong_token_for_handler() {
    let result = auth::validate_ws_query("token=wrong", Some("right"));
    assert!(result.is_err());
}
