// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::Serialize;

/// One attachment on a translated message: `{name, contentType, url}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub url: String,
}

/// A single translated message: `{role, content, attachments[], experimental_attachments?[]}`.
#[derive(Debug, Clone, Serialize)]
pub struct MessageTemplate {
    pub role: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    #[serde(rename = "experimental_attachments")]
    pub experimental_attachments: Vec<Attachment>,
    #[serde(rename = "participantPosition", skip_serializing_if = "Option::is_none")]
    pub participant_position: Option<String>,
}

impl MessageTemplate {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            attachments: Vec::new(),
            experimental_attachments: Vec::new(),
            participant_position: None,
        }
    }
}

/// The upstream session payload produced by the translator.
#[derive(Debug, Clone, Serialize)]
pub struct TranslatedPayload {
    pub message_templates: Vec<MessageTemplate>,
    pub target_model_id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_image_request: Option<bool>,
}

/// Infer a MIME content type from a data-URL prefix or a file extension.
pub fn infer_content_type(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, _)) = rest.split_once(';') {
            if !mime.is_empty() {
                return mime.to_owned();
            }
        }
    }
    mime_guess::from_path(url).first_raw().unwrap_or("application/octet-stream").to_owned()
}
