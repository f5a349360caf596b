// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `arenabridge` binary and
//! exercise its HTTP, WebSocket, and admin surfaces.

use std::time::Duration;

use bridge_specs::BridgeProcess;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn admin_stats_reports_zeroed_counters_on_boot() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start()?;
    bridge.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value =
        reqwest::get(format!("{}/admin/stats", bridge.base_url())).await?.json().await?;

    assert_eq!(resp["requests_total"], 0);
    assert_eq!(resp["requests_failed"], 0);
    assert_eq!(resp["recent_requests"].as_array().map(|a| a.len()), Some(0));

    Ok(())
}

#[tokio::test]
async fn admin_routes_require_bearer_when_token_configured() -> anyhow::Result<()> {
    let bridge = BridgeProcess::build().admin_token("smoke-secret").spawn()?;
    bridge.wait_healthy(TIMEOUT).await?;

    let unauthenticated = reqwest::get(format!("{}/admin/stats", bridge.base_url())).await?;
    assert_eq!(unauthenticated.status().as_u16(), 401);

    let authenticated = reqwest::Client::new()
        .get(format!("{}/admin/stats", bridge.base_url()))
        .bearer_auth("smoke-secret")
        .send()
        .await?;
    assert!(authenticated.status().is_success());

    Ok(())
}

#[tokio::test]
async fn v1_models_404s_with_no_models_configured() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start()?;
    bridge.wait_healthy(TIMEOUT).await?;

    let resp = reqwest::get(format!("{}/v1/models", bridge.base_url())).await?;
    assert_eq!(resp.status().as_u16(), 404);

    Ok(())
}

#[tokio::test]
async fn v1_chat_completions_without_bearer_is_unauthorized() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start()?;
    bridge.wait_healthy(TIMEOUT).await?;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", bridge.base_url()))
        .json(&serde_json::json!({"model": "m1", "stream": false, "messages": []}))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 401);

    Ok(())
}

#[tokio::test]
async fn ws_peer_upgrade_accepts_and_can_be_closed_cleanly() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start()?;
    bridge.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(bridge.ws_url()).await?;
    ws.send(Message::Close(None)).await?;

    let closed = tokio::time::timeout(TIMEOUT, ws.next()).await?;
    assert!(matches!(closed, Some(Ok(Message::Close(_))) | None));

    Ok(())
}

#[tokio::test]
async fn ws_upgrade_without_token_is_rejected_when_admin_token_configured() -> anyhow::Result<()> {
    let bridge = BridgeProcess::build().admin_token("ws-secret").spawn()?;
    bridge.wait_healthy(TIMEOUT).await?;

    let bare_url = format!("ws://127.0.0.1:{}/ws", bridge.port());
    let result = tokio_tungstenite::connect_async(bare_url).await;
    assert!(result.is_err());

    let (mut ws, _) = tokio_tungstenite::connect_async(bridge.ws_url()).await?;
    ws.send(Message::Close(None)).await?;

    Ok(())
}

#[tokio::test]
async fn admin_config_reload_picks_up_edited_session_id() -> anyhow::Result<()> {
    let bridge = BridgeProcess::start()?;
    bridge.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(bridge.ws_url()).await?;

    std::fs::write(
        bridge.config_path(),
        serde_json::to_vec_pretty(&serde_json::json!({
            "session_id": "reloaded-session",
            "message_id": "reloaded-message",
            "use_default_ids_if_mapping_not_found": true,
        }))?,
    )?;

    let resp = reqwest::Client::new()
        .post(format!("{}/admin/config/reload", bridge.base_url()))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 204);

    let base_url = bridge.base_url();
    let chat = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("{base_url}/v1/chat/completions"))
            .bearer_auth("smoke-token")
            .json(&serde_json::json!({
                "model": "unmapped-model",
                "stream": false,
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .send()
            .await
    });

    let frame = tokio::time::timeout(TIMEOUT, ws.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("peer socket closed before request arrived"))??;
    let envelope: serde_json::Value = match frame {
        Message::Text(text) => serde_json::from_str(&text)?,
        other => anyhow::bail!("expected a text frame, got {other:?}"),
    };

    // The dispatched payload's session_id reflects the config reloaded above,
    // not the session_id the process was originally started with.
    assert_eq!(envelope["payload"]["session_id"], "reloaded-session");
    assert_eq!(envelope["payload"]["message_id"], "reloaded-message");
    let request_id = envelope["requestId"].as_str().unwrap().to_owned();

    ws.send(Message::Text(serde_json::json!({"requestId": request_id, "data": "a0:\"done\"\n"}).to_string().into())).await?;
    ws.send(Message::Text(serde_json::json!({"requestId": request_id, "data": "[DONE]"}).to_string().into())).await?;

    let response = chat.await??;
    assert!(response.status().is_success());

    Ok(())
}
