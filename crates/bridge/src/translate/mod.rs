// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Payload Translator (spec §4.3): turns an OpenAI chat-completion request
//! into the upstream session payload, applying history stripping, role
//! normalization, tavern-mode merge, bypass injection, participant-position
//! assignment, and file-bed upload of inline base64 images.

pub mod types;

use std::sync::atomic::AtomicUsize;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::{BattleTarget, Config, IdUpdaterMode};
use crate::error::BridgeError;
use crate::image_pipe::{filebed, DisabledEndpoints, FileBedUrlCache};
use crate::model_map::{EndpointMapping, ModelType};
use crate::openai::{ChatCompletionRequest, ChatMessage, ContentPart, MessageContent};

pub use types::{infer_content_type, Attachment, MessageTemplate, TranslatedPayload};

/// Markdown image link, e.g. `![alt](https://example.com/a.png)`.
#[allow(clippy::unwrap_used, reason = "pattern is a fixed literal, compiles at every call site")]
static MARKDOWN_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").unwrap());

/// Everything the translator needs beyond the request/endpoint themselves,
/// bundled so the pipeline's step functions stay readable.
pub struct TranslateContext<'a> {
    pub config: &'a Config,
    pub http_client: &'a reqwest::Client,
    pub disabled_endpoints: &'a DisabledEndpoints,
    pub filebed_round_robin: &'a AtomicUsize,
    pub filebed_cache: &'a FileBedUrlCache,
}

/// Run the full translation pipeline (spec §4.3 steps 1-8).
pub async fn translate(
    request: &ChatCompletionRequest,
    endpoint: &EndpointMapping,
    model_type: ModelType,
    ctx: &TranslateContext<'_>,
) -> Result<TranslatedPayload, BridgeError> {
    let config = ctx.config;

    let mut messages = strip_history_reasoning(&request.messages, config);
    normalize_roles(&mut messages);
    let mut templates: Vec<MessageTemplate> = messages.iter().map(process_message).collect();

    if config.tavern_mode_enabled {
        templates = merge_tavern_mode(templates);
    }

    if model_type == ModelType::Image && config.image_attachment_bypass_enabled {
        split_image_attachment_bypass(&mut templates);
    }

    if config.effective_bypass(model_type.as_str()) {
        append_bypass_injection(&mut templates, config);
    }

    let mode = endpoint.mode.unwrap_or(config.id_updater_last_mode);
    let battle_target = endpoint.battle_target.unwrap_or(config.id_updater_battle_target);
    assign_participant_positions(&mut templates, mode, battle_target);

    if config.file_bed_enabled {
        upload_inline_images(&mut templates, ctx).await?;
    }

    Ok(TranslatedPayload {
        message_templates: templates,
        target_model_id: request.model.clone(),
        session_id: endpoint.session_id.clone(),
        message_id: endpoint.message_id.clone(),
        is_image_request: (model_type == ModelType::Image).then_some(true),
    })
}

/// Step 1: strip `<think>...</think>` prefixes from assistant history when
/// `reasoning_output_mode == think_tag` and stripping is enabled.
fn strip_history_reasoning(messages: &[ChatMessage], config: &Config) -> Vec<ChatMessage> {
    use crate::config::ReasoningOutputMode;

    if !config.strip_reasoning_from_history || config.reasoning_output_mode != ReasoningOutputMode::ThinkTag
    {
        return messages.to_vec();
    }

    messages
        .iter()
        .map(|m| {
            if m.role != "assistant" {
                return m.clone();
            }
            let mut stripped = m.clone();
            if let Some(MessageContent::Text(text)) = &m.content {
                if let Some(end) = text.find("</think>") {
                    if text.trim_start().starts_with("<think>") {
                        let rest = &text[end + "</think>".len()..];
                        stripped.content = Some(MessageContent::Text(rest.trim_start().to_owned()));
                    }
                }
            }
            stripped
        })
        .collect()
}

/// Step 2: `developer` -> `system`.
fn normalize_roles(messages: &mut [ChatMessage]) {
    for m in messages {
        if m.role == "developer" {
            m.role = "system".to_owned();
        }
    }
}

/// Step 3: per-message processing into a `MessageTemplate`.
fn process_message(message: &ChatMessage) -> MessageTemplate {
    let mut template = MessageTemplate::new(message.role.clone(), String::new());

    match &message.content {
        None => {}
        Some(MessageContent::Text(text)) => {
            if message.role == "assistant" {
                let (stripped, images) = extract_markdown_images(text);
                template.content = stripped;
                template.experimental_attachments = images;
            } else {
                template.content = text.clone();
            }
        }
        Some(MessageContent::Parts(parts)) => {
            let text = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            let images: Vec<Attachment> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(Attachment {
                        name: "image".to_owned(),
                        content_type: infer_content_type(&image_url.url),
                        url: image_url.url.clone(),
                    }),
                    ContentPart::Text { .. } => None,
                })
                .collect();

            template.content = text;
            if message.role == "assistant" {
                template.experimental_attachments = images;
            } else {
                template.attachments = images;
            }
        }
    }

    if message.role == "user" && template.content.is_empty() {
        template.content = " ".to_owned();
    }

    template
}

/// Extract markdown image links from `text`, returning the stripped text and
/// the extracted images as attachments (spec §4.3 step 3).
fn extract_markdown_images(text: &str) -> (String, Vec<Attachment>) {
    let mut images = Vec::new();
    for caps in MARKDOWN_IMAGE.captures_iter(text) {
        let url = caps[2].to_owned();
        images.push(Attachment {
            name: "image".to_owned(),
            content_type: infer_content_type(&url),
            url,
        });
    }
    let stripped = MARKDOWN_IMAGE.replace_all(text, "").trim().to_owned();
    (stripped, images)
}

/// Step 4: concatenate every leading `system` message into one.
fn merge_tavern_mode(templates: Vec<MessageTemplate>) -> Vec<MessageTemplate> {
    let (system, rest): (Vec<_>, Vec<_>) = templates.into_iter().partition(|t| t.role == "system");
    if system.is_empty() {
        return rest;
    }
    let merged_content = system.iter().map(|t| t.content.as_str()).collect::<Vec<_>>().join("\n\n");
    let mut out = vec![MessageTemplate::new("system", merged_content)];
    out.extend(rest);
    out
}

/// Step 5: split the last user message with both text and image(s) into two
/// consecutive user messages (image models only).
fn split_image_attachment_bypass(templates: &mut Vec<MessageTemplate>) {
    let Some(idx) = templates.iter().rposition(|t| t.role == "user") else { return };
    let has_text = !templates[idx].content.trim().is_empty();
    let has_images = !templates[idx].attachments.is_empty();
    if !(has_text && has_images) {
        return;
    }

    let original = templates.remove(idx);
    let mut image_only = MessageTemplate::new("user", " ");
    image_only.attachments = original.attachments;

    let text_only = MessageTemplate::new("user", original.content);

    templates.insert(idx, text_only);
    templates.insert(idx, image_only);
}

/// Step 6: append the configured bypass-injection trailing message.
fn append_bypass_injection(templates: &mut Vec<MessageTemplate>, config: &Config) {
    let preset = config.bypass_injection.resolve();
    let mut template = MessageTemplate::new(preset.role, preset.content);
    template.participant_position = Some(preset.participant_position);
    templates.push(template);
}

/// Step 7: assign `participantPosition` per message, per mode.
fn assign_participant_positions(
    templates: &mut [MessageTemplate],
    mode: IdUpdaterMode,
    battle_target: BattleTarget,
) {
    let target_letter = match battle_target {
        BattleTarget::A => "a",
        BattleTarget::B => "b",
    };

    for t in templates.iter_mut() {
        if t.participant_position.is_some() {
            continue;
        }
        t.participant_position = Some(match mode {
            IdUpdaterMode::Battle => target_letter.to_owned(),
            IdUpdaterMode::DirectChat => {
                if t.role == "system" {
                    "b".to_owned()
                } else {
                    "a".to_owned()
                }
            }
        });
    }
}

/// Step 8: replace every inline base64 image occurrence (markdown or
/// attachment URL) with its file-bed uploaded URL.
async fn upload_inline_images(
    templates: &mut [MessageTemplate],
    ctx: &TranslateContext<'_>,
) -> Result<(), BridgeError> {
    for template in templates.iter_mut() {
        for attachment in template.attachments.iter_mut().chain(template.experimental_attachments.iter_mut())
        {
            if let Some(replacement) = upload_if_base64(&attachment.url, &attachment.content_type, ctx).await? {
                attachment.url = replacement;
            }
        }
    }
    Ok(())
}

/// If `url` is a `data:` base64 payload, upload it (using the cache first)
/// and return the file-bed URL; otherwise `None`.
async fn upload_if_base64(
    url: &str,
    content_type: &str,
    ctx: &TranslateContext<'_>,
) -> Result<Option<String>, BridgeError> {
    let Some(encoded) = url.strip_prefix("data:").and_then(|rest| rest.split_once(";base64,")).map(|(_, b64)| b64)
    else {
        return Ok(None);
    };

    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    let digest = hex::encode(hasher.finalize());

    if let Some(cached) = ctx.filebed_cache.get(&digest).await {
        return Ok(Some(cached));
    }

    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| BridgeError::AttachmentProcessing)?;

    let file_name = format!("{digest}.bin");
    let uploaded = filebed::upload_with_failover(
        ctx.http_client,
        ctx.config,
        ctx.disabled_endpoints,
        ctx.filebed_round_robin,
        &file_name,
        content_type,
        bytes,
    )
    .await?;

    ctx.filebed_cache.insert(digest, uploaded.clone()).await;
    Ok(Some(uploaded))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
