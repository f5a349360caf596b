// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OpenAI-compatible bridge proxy: delegates chat completions to a single
//! paired browser peer over a persistent WebSocket.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod external;
pub mod image_pipe;
pub mod model_map;
pub mod monitor;
pub mod openai;
pub mod retry;
pub mod state;
pub mod stream;
pub mod transport;
pub mod translate;

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{CliArgs, Config};
use crate::external::{InMemoryTokenValidator, NaiveGeoClassifier};
use crate::image_pipe::{build_client, DisabledEndpoints, Downloader, FileBedUrlCache, ImageBase64Cache};
use crate::model_map::{ModelEndpointMap, ModelMap, RoundRobinIndex};
use crate::monitor::Metrics;
use crate::state::{AppState, PendingQueue, RequestRegistry, WsHub};
use crate::transport::build_router;

/// Run the bridge until shutdown.
pub async fn run(args: CliArgs) -> anyhow::Result<()> {
    let addr = format!("{}:{}", args.host, args.port);
    let shutdown = CancellationToken::new();

    let config = Config::load(&args.config)?;
    let model_endpoint_map = if args.model_map.exists() {
        ModelEndpointMap::load(&args.model_map)?
    } else {
        ModelEndpointMap::default()
    };
    let model_map = if args.models.exists() { ModelMap::load(&args.models)? } else { ModelMap::default() };

    let http_client = build_client(&config)?;
    let max_concurrent_downloads = config.max_concurrent_downloads;

    let state = Arc::new(AppState {
        config: tokio::sync::RwLock::new(Arc::new(config)),
        config_path: args.config.clone(),
        model_map_path: args.model_map.clone(),
        models_path: args.models.clone(),
        model_endpoint_map: tokio::sync::RwLock::new(Arc::new(model_endpoint_map)),
        model_map: tokio::sync::RwLock::new(Arc::new(model_map)),
        round_robin: RoundRobinIndex::new(),
        registry: RequestRegistry::new(),
        pending: PendingQueue::new(),
        ws_hub: WsHub::new(),
        image_cache: ImageBase64Cache::new(),
        filebed_cache: FileBedUrlCache::new(),
        disabled_endpoints: DisabledEndpoints::new(),
        filebed_round_robin: AtomicUsize::new(0),
        downloader: Downloader::new(http_client.clone(), max_concurrent_downloads),
        http_client,
        token_validator: Arc::new(InMemoryTokenValidator::new(None)),
        geo_classifier: Arc::new(NaiveGeoClassifier),
        admin_token: args.admin_token.clone(),
        metrics: Metrics::new(),
        shutdown: shutdown.clone(),
    });

    tokio::spawn(retry::run_recovery_loop(Arc::clone(&state)));
    monitor::spawn(Arc::clone(&state));

    tracing::info!(%addr, "arenabridge listening");
    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
