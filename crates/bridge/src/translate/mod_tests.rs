// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::AtomicUsize;

use base64::Engine;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::openai::{ChatMessage, MessageContent};

fn base_config(extra: &str) -> Config {
    let text = format!(
        r#"{{
            session_id: "s1",
            message_id: "m1",
            {extra}
        }}"#
    );
    json5::from_str(&text).unwrap()
}

fn endpoint() -> EndpointMapping {
    EndpointMapping {
        session_id: "session-a".to_owned(),
        message_id: "message-a".to_owned(),
        mode: None,
        battle_target: None,
        model_type: None,
    }
}

fn text_message(role: &str, content: &str) -> ChatMessage {
    ChatMessage { role: role.to_owned(), content: Some(MessageContent::Text(content.to_owned())) }
}

fn ctx<'a>(
    config: &'a Config,
    client: &'a reqwest::Client,
    disabled: &'a DisabledEndpoints,
    rr: &'a AtomicUsize,
    cache: &'a FileBedUrlCache,
) -> TranslateContext<'a> {
    TranslateContext {
        config,
        http_client: client,
        disabled_endpoints: disabled,
        filebed_round_robin: rr,
        filebed_cache: cache,
    }
}

#[tokio::test]
async fn developer_role_is_normalized_to_system() {
    let config = base_config("");
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![text_message("developer", "be terse")],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();

    let payload = translate(&request, &endpoint(), ModelType::Text, &ctx(&config, &client, &disabled, &rr, &cache))
        .await
        .unwrap();

    assert_eq!(payload.message_templates[0].role, "system");
}

#[tokio::test]
async fn empty_user_message_becomes_a_single_space() {
    let config = base_config("");
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![text_message("user", "")],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();

    let payload = translate(&request, &endpoint(), ModelType::Text, &ctx(&config, &client, &disabled, &rr, &cache))
        .await
        .unwrap();

    assert_eq!(payload.message_templates[0].content, " ");
}

#[tokio::test]
async fn assistant_markdown_image_is_moved_to_experimental_attachments() {
    let config = base_config("");
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![text_message("assistant", "here you go ![a pic](https://x.test/a.png) enjoy")],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();

    let payload = translate(&request, &endpoint(), ModelType::Text, &ctx(&config, &client, &disabled, &rr, &cache))
        .await
        .unwrap();

    let msg = &payload.message_templates[0];
    assert!(!msg.content.contains("!["));
    assert_eq!(msg.experimental_attachments.len(), 1);
    assert_eq!(msg.experimental_attachments[0].url, "https://x.test/a.png");
}

#[tokio::test]
async fn tavern_mode_merges_leading_system_messages() {
    let config = base_config("tavern_mode_enabled: true");
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![
            text_message("system", "rule one"),
            text_message("system", "rule two"),
            text_message("user", "hi"),
        ],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();

    let payload = translate(&request, &endpoint(), ModelType::Text, &ctx(&config, &client, &disabled, &rr, &cache))
        .await
        .unwrap();

    assert_eq!(payload.message_templates.len(), 2);
    assert_eq!(payload.message_templates[0].role, "system");
    assert_eq!(payload.message_templates[0].content, "rule one\n\nrule two");
}

#[tokio::test]
async fn bypass_disabled_appends_no_trailing_message() {
    let config = base_config("bypass_enabled: false");
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![text_message("user", "hi")],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();

    let payload = translate(&request, &endpoint(), ModelType::Text, &ctx(&config, &client, &disabled, &rr, &cache))
        .await
        .unwrap();

    assert_eq!(payload.message_templates.len(), 1);
}

#[tokio::test]
async fn bypass_enabled_appends_exactly_one_configured_message() {
    let config = base_config(
        r#"bypass_enabled: true, bypass_injection: { custom: { role: "user", content: "continue", participant_position: "a" } }"#,
    );
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![text_message("user", "hi")],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();

    let payload = translate(&request, &endpoint(), ModelType::Text, &ctx(&config, &client, &disabled, &rr, &cache))
        .await
        .unwrap();

    assert_eq!(payload.message_templates.len(), 2);
    let trailing = payload.message_templates.last().unwrap();
    assert_eq!(trailing.content, "continue");
    assert_eq!(trailing.participant_position.as_deref(), Some("a"));
}

#[tokio::test]
async fn direct_chat_mode_assigns_system_to_b_and_others_to_a() {
    let config = base_config("");
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![text_message("system", "rules"), text_message("user", "hi")],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();

    let payload = translate(&request, &endpoint(), ModelType::Text, &ctx(&config, &client, &disabled, &rr, &cache))
        .await
        .unwrap();

    assert_eq!(payload.message_templates[0].participant_position.as_deref(), Some("b"));
    assert_eq!(payload.message_templates[1].participant_position.as_deref(), Some("a"));
}

#[tokio::test]
async fn battle_mode_assigns_every_message_to_the_chosen_target() {
    let config = base_config("id_updater_last_mode: \"battle\", id_updater_battle_target: \"B\"");
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![text_message("system", "rules"), text_message("user", "hi")],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();

    let payload = translate(&request, &endpoint(), ModelType::Text, &ctx(&config, &client, &disabled, &rr, &cache))
        .await
        .unwrap();

    assert!(payload
        .message_templates
        .iter()
        .all(|t| t.participant_position.as_deref() == Some("b")));
}

#[tokio::test]
async fn inline_base64_image_is_uploaded_and_cached_on_second_translation() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("https://filebed.test/uploaded.png"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = base_config(&format!(
        r#"file_bed_enabled: true, file_bed_endpoints: [{{
            name: "primary",
            url: "{}",
            form_file_field: "file",
            response_type: "text",
        }}]"#,
        mock_server.uri()
    ));

    let b64 = base64::engine::general_purpose::STANDARD.encode(b"fake-png-bytes");
    let data_url = format!("data:image/png;base64,{b64}");
    let request = ChatCompletionRequest {
        model: "gpt-4".to_owned(),
        messages: vec![text_message("assistant", &format!("look ![x]({data_url})"))],
        stream: false,
    };
    let client = reqwest::Client::new();
    let disabled = DisabledEndpoints::new();
    let rr = AtomicUsize::new(0);
    let cache = FileBedUrlCache::new();
    let context = ctx(&config, &client, &disabled, &rr, &cache);

    let first = translate(&request, &endpoint(), ModelType::Text, &context).await.unwrap();
    assert_eq!(
        first.message_templates[0].experimental_attachments[0].url,
        "https://filebed.test/uploaded.png"
    );

    // Second translation of the same payload must hit the cache, not issue a
    // second upload (the mock expects exactly one call).
    let second = translate(&request, &endpoint(), ModelType::Text, &context).await.unwrap();
    assert_eq!(
        second.message_templates[0].experimental_attachments[0].url,
        "https://filebed.test/uploaded.png"
    );
}
