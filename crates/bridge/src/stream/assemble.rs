// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Response Assemblers (spec §4.5): turn a [`ParsedEvent`] stream into either
//! an SSE byte stream or a single non-streaming JSON body.

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONNECTION};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;

use crate::config::ReasoningOutputMode;
use crate::openai::{estimate_tokens, ChatCompletionResponse, Choice, ResponseMessage, Usage};

use super::parser::ParsedEvent;

/// Shared bookkeeping for both assemblers: a `content` buffer, a `reasoning`
/// buffer, and the remembered finish reason.
#[derive(Default)]
struct Accumulator {
    content: String,
    reasoning: String,
    finish_reason: Option<String>,
    saw_error: bool,
}

impl Accumulator {
    fn reasoning_prefix(&self, mode: ReasoningOutputMode) -> String {
        match mode {
            ReasoningOutputMode::ThinkTag if !self.reasoning.is_empty() => {
                format!("<think>{}</think>\n\n", self.reasoning)
            }
            _ => String::new(),
        }
    }
}

/// Render one SSE `data: ...\n\n` frame.
fn sse_frame(payload: &serde_json::Value) -> String {
    format!("data: {}\n\n", payload)
}

fn delta_chunk(request_id: &str, model: &str, delta: serde_json::Value) -> serde_json::Value {
    json!({
        "id": request_id,
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": serde_json::Value::Null }],
    })
}

fn terminating_chunk(request_id: &str, model: &str, finish_reason: &str) -> serde_json::Value {
    json!({
        "id": request_id,
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{ "index": 0, "delta": {}, "finish_reason": finish_reason }],
    })
}

/// Stateful streaming assembler: call [`Self::apply`] for each parsed event
/// (flattening `Images` into pre-rendered markdown content before handing it
/// here is the caller's job, per §4.6) and collect the SSE frames it returns.
pub struct StreamingAssembler {
    request_id: String,
    model: String,
    reasoning_mode: ReasoningOutputMode,
    preserve_streaming: bool,
    acc: Accumulator,
}

impl StreamingAssembler {
    pub fn new(request_id: String, model: String, reasoning_mode: ReasoningOutputMode, preserve_streaming: bool) -> Self {
        Self { request_id, model, reasoning_mode, preserve_streaming, acc: Accumulator::default() }
    }

    /// Content assembled so far, for post-hoc usage estimation (spec §4.5
    /// token counts apply to streaming responses too).
    pub fn accumulated_content(&self) -> &str {
        &self.acc.content
    }

    /// Apply one parsed event, returning zero or more SSE frames to forward.
    pub fn apply(&mut self, event: ParsedEvent) -> Vec<String> {
        match event {
            ParsedEvent::Content(text) => {
                self.acc.content.push_str(&text);
                vec![sse_frame(&delta_chunk(&self.request_id, &self.model, json!({ "content": text })))]
            }
            ParsedEvent::Reasoning(text) => {
                self.acc.reasoning.push_str(&text);
                if self.reasoning_mode == ReasoningOutputMode::Openai && self.preserve_streaming {
                    vec![sse_frame(&delta_chunk(&self.request_id, &self.model, json!({ "reasoning_content": text })))]
                } else {
                    Vec::new()
                }
            }
            ParsedEvent::ReasoningEnd => {
                if self.reasoning_mode == ReasoningOutputMode::ThinkTag && !self.acc.reasoning.is_empty() {
                    let wrapped = format!("<think>{}</think>\n\n", self.acc.reasoning);
                    self.acc.reasoning.clear();
                    vec![sse_frame(&delta_chunk(&self.request_id, &self.model, json!({ "content": wrapped })))]
                } else {
                    Vec::new()
                }
            }
            ParsedEvent::ReasoningComplete(text) => {
                if self.reasoning_mode == ReasoningOutputMode::ThinkTag && !text.is_empty() {
                    vec![sse_frame(&delta_chunk(
                        &self.request_id,
                        &self.model,
                        json!({ "content": format!("<think>{text}</think>\n\n") }),
                    ))]
                } else {
                    Vec::new()
                }
            }
            ParsedEvent::Images(_) => Vec::new(),
            ParsedEvent::Finish(reason) => {
                self.acc.finish_reason = Some(reason);
                Vec::new()
            }
            ParsedEvent::RetryInfo(_) => Vec::new(),
            ParsedEvent::CaptchaPending => Vec::new(),
            ParsedEvent::Error(message) => {
                self.acc.saw_error = true;
                let synthetic = format!("\n\n[Luma API Error]: {message}");
                vec![
                    sse_frame(&delta_chunk(&self.request_id, &self.model, json!({ "content": synthetic }))),
                    sse_frame(&terminating_chunk(&self.request_id, &self.model, "stop")),
                    "data: [DONE]\n\n".to_owned(),
                ]
            }
            ParsedEvent::Done => {
                let reason = self.acc.finish_reason.clone().unwrap_or_else(|| "stop".to_owned());
                vec![
                    sse_frame(&terminating_chunk(&self.request_id, &self.model, &reason)),
                    "data: [DONE]\n\n".to_owned(),
                ]
            }
        }
    }
}

/// Response headers required for the SSE body (spec §4.5).
pub fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no"));
    headers.insert(HeaderName::from_static("transfer-encoding"), HeaderValue::from_static("chunked"));
    headers
}

/// Wrap a channel of pre-rendered SSE frames into an axum streaming response.
pub fn sse_response(rx: tokio::sync::mpsc::Receiver<String>) -> Response {
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(|frame| Ok::<_, std::io::Error>(frame));
    let mut response = Response::new(Body::from_stream(stream));
    *response.headers_mut() = sse_headers();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
}

/// Non-stream assembler: feed every event in order, then call
/// [`Self::finish`] once `Done` has been observed.
#[derive(Default)]
pub struct NonStreamAssembler {
    acc: Accumulator,
}

impl NonStreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ParsedEvent) {
        match event {
            ParsedEvent::Content(text) => self.acc.content.push_str(text),
            ParsedEvent::Reasoning(text) => self.acc.reasoning.push_str(text),
            ParsedEvent::ReasoningComplete(text) => self.acc.reasoning.push_str(text),
            ParsedEvent::Finish(reason) => self.acc.finish_reason = Some(reason.clone()),
            ParsedEvent::Error(message) => {
                self.acc.saw_error = true;
                self.acc.content.push_str(&format!("\n\n[Luma API Error]: {message}"));
            }
            ParsedEvent::ReasoningEnd | ParsedEvent::Images(_) | ParsedEvent::RetryInfo(_) | ParsedEvent::CaptchaPending | ParsedEvent::Done => {}
        }
    }

    /// Build the final `ChatCompletionResponse`, estimating token usage from
    /// `prompt_text` (the concatenation of every input message's text parts)
    /// and the assembled output.
    pub fn finish(
        self,
        request_id: String,
        model: String,
        prompt_text: &str,
        reasoning_mode: ReasoningOutputMode,
        created: i64,
    ) -> ChatCompletionResponse {
        let finish_reason = if self.acc.saw_error {
            "stop".to_owned()
        } else {
            self.acc.finish_reason.unwrap_or_else(|| "stop".to_owned())
        };

        let (content, reasoning_content) = match reasoning_mode {
            ReasoningOutputMode::ThinkTag => {
                let prefix = self.acc.reasoning_prefix(reasoning_mode);
                (format!("{prefix}{}", self.acc.content), None)
            }
            ReasoningOutputMode::Openai => {
                let reasoning = (!self.acc.reasoning.is_empty()).then_some(self.acc.reasoning);
                (self.acc.content, reasoning)
            }
        };

        let completion_tokens = estimate_tokens(&content) + reasoning_content.as_deref().map(estimate_tokens).unwrap_or(0);

        ChatCompletionResponse {
            id: request_id,
            object: "chat.completion",
            created,
            model: model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage { role: "assistant", content, reasoning_content },
                finish_reason,
            }],
            usage: Usage {
                prompt_tokens: estimate_tokens(prompt_text),
                completion_tokens,
                total_tokens: estimate_tokens(prompt_text) + completion_tokens,
            },
        }
    }
}

impl IntoResponse for ChatCompletionResponse {
    fn into_response(self) -> Response {
        axum::Json(self).into_response()
    }
}

#[cfg(test)]
#[path = "assemble_tests.rs"]
mod tests;
