// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `arenabridge` binary as a subprocess and exercises it
//! over HTTP and WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `arenabridge` binary.
pub fn bridge_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("arenabridge")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `arenabridge` process that is killed on drop.
pub struct BridgeProcess {
    child: Child,
    port: u16,
    admin_token: Option<String>,
    config_path: PathBuf,
    _config_dir: tempfile::TempDir,
}

/// Builder for configuring a spawned [`BridgeProcess`].
pub struct BridgeBuilder {
    session_id: String,
    message_id: String,
    admin_token: Option<String>,
    extra_config: serde_json::Map<String, serde_json::Value>,
    model_endpoint_map: Option<serde_json::Value>,
    models: Option<serde_json::Value>,
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self {
            session_id: "smoke-session".to_owned(),
            message_id: "smoke-message".to_owned(),
            admin_token: None,
            extra_config: serde_json::Map::new(),
            model_endpoint_map: None,
            models: None,
        }
    }
}

impl BridgeBuilder {
    /// Require a bearer token on `/admin/*`.
    pub fn admin_token(mut self, token: &str) -> Self {
        self.admin_token = Some(token.to_owned());
        self
    }

    /// Merge an extra top-level key into the generated `config.jsonc`.
    pub fn config_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra_config.insert(key.to_owned(), value);
        self
    }

    /// Provide the contents of `model_endpoint_map.json` directly.
    pub fn model_endpoint_map(mut self, value: serde_json::Value) -> Self {
        self.model_endpoint_map = Some(value);
        self
    }

    /// Provide the contents of `models.json` (the plain model-type fallback) directly.
    pub fn models(mut self, value: serde_json::Value) -> Self {
        self.models = Some(value);
        self
    }

    /// Spawn `arenabridge` with the configured settings.
    pub fn spawn(self) -> anyhow::Result<BridgeProcess> {
        ensure_crypto();
        let binary = bridge_binary();
        anyhow::ensure!(binary.exists(), "arenabridge binary not found at {}", binary.display());

        let port = free_port()?;
        let dir = tempfile::tempdir()?;

        let mut config = serde_json::json!({
            "session_id": self.session_id,
            "message_id": self.message_id,
        });
        if let serde_json::Value::Object(ref mut map) = config {
            map.extend(self.extra_config);
        }
        let config_path = dir.path().join("config.jsonc");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

        let model_endpoint_map_path = dir.path().join("model_endpoint_map.json");
        let model_endpoint_map = self.model_endpoint_map.unwrap_or_else(|| serde_json::json!({}));
        std::fs::write(&model_endpoint_map_path, serde_json::to_vec_pretty(&model_endpoint_map)?)?;

        let models_path = dir.path().join("models.json");
        let models = self.models.unwrap_or_else(|| serde_json::json!({}));
        std::fs::write(&models_path, serde_json::to_vec_pretty(&models)?)?;

        let mut args: Vec<String> = vec![
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--config".into(),
            config_path.to_string_lossy().into_owned(),
            "--model-map".into(),
            model_endpoint_map_path.to_string_lossy().into_owned(),
            "--models".into(),
            models_path.to_string_lossy().into_owned(),
        ];
        if let Some(ref token) = self.admin_token {
            args.extend(["--admin-token".into(), token.clone()]);
        }

        let child = Command::new(&binary)
            .args(&args)
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(BridgeProcess { child, port, admin_token: self.admin_token, config_path, _config_dir: dir })
    }
}

impl BridgeProcess {
    /// Create a builder for custom startup configuration.
    pub fn build() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// Spawn with the default single-session configuration.
    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    /// Path to the `config.jsonc` this process was started with, for tests
    /// that edit it on disk and exercise `/admin/config/reload`.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Base URL for HTTP requests.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// WebSocket URL for the single-peer upgrade, with the token query
    /// parameter attached when an admin token is configured.
    pub fn ws_url(&self) -> String {
        match &self.admin_token {
            Some(token) => format!("ws://127.0.0.1:{}/ws?token={token}", self.port),
            None => format!("ws://127.0.0.1:{}/ws", self.port),
        }
    }

    /// Poll `/admin/stats` until the process accepts connections.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/admin/stats", self.base_url());

        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("arenabridge did not become healthy within {timeout:?}");
            }

            let mut request = client.get(&url);
            if let Some(ref token) = self.admin_token {
                request = request.bearer_auth(token);
            }
            if let Ok(resp) = request.send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
