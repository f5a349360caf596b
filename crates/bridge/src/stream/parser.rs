// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream Parser (spec §4.4): turns raw upstream fragments pulled off a
//! request's event queue into typed [`ParsedEvent`]s. Pure and synchronous;
//! image batches are handed upward as URLs rather than rendered here, since
//! rendering is async and belongs to the image pipeline.

use std::sync::LazyLock;

use regex::Regex;

use crate::state::{InboundFragment, RetryInfo};

/// Tag prefix a frame starts with, e.g. `a0:`, `ag:`, `b2:`, `ad:`.
#[allow(clippy::unwrap_used, reason = "pattern is a fixed literal, compiles at every call site")]
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(a0|b0|ag|a2|b2|ad|bd):").unwrap());

const CLOUDFLARE_MARKERS: &[&str] =
    &["Just a moment...", "Enable JavaScript and cookies to continue"];

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Content(String),
    Reasoning(String),
    ReasoningEnd,
    ReasoningComplete(String),
    /// Upstream image descriptors (`a2:`/`b2:`), left unrendered for the
    /// image pipeline to turn into markdown.
    Images(Vec<String>),
    Finish(String),
    Error(String),
    RetryInfo(RetryInfo),
    /// A Cloudflare challenge was seen; caller decides whether to send a
    /// `refresh` command based on [`crate::state::WsHub::is_refreshing`].
    CaptchaPending,
    Done,
}

/// Converts a request's stream of [`InboundFragment`]s into [`ParsedEvent`]s.
pub struct StreamParser {
    buffer: String,
    reasoning_active: bool,
    reasoning_accum: String,
    done: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self { buffer: String::new(), reasoning_active: false, reasoning_accum: String::new(), done: false }
    }

    /// Feed one fragment pulled off the event queue, returning the events it
    /// produced, in order.
    pub fn feed(&mut self, fragment: InboundFragment) -> Vec<ParsedEvent> {
        if self.done {
            return Vec::new();
        }
        match fragment {
            InboundFragment::Error { error } => {
                self.done = true;
                vec![ParsedEvent::Error(friendly_error_message(&error))]
            }
            InboundFragment::RetryInfo { retry_info } => vec![ParsedEvent::RetryInfo(retry_info)],
            InboundFragment::Text(text) => self.ingest(&text),
            InboundFragment::List(items) => {
                let mut events = Vec::new();
                for item in items {
                    events.extend(self.ingest(&item));
                }
                events
            }
        }
    }

    /// Resolve any reasoning that never saw a following `content` token. Call
    /// this when the event queue closes without a `[DONE]` sentinel.
    pub fn flush(&mut self) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        self.flush_as_complete(&mut events);
        events
    }

    fn ingest(&mut self, chunk: &str) -> Vec<ParsedEvent> {
        self.buffer.push_str(chunk);
        self.drain()
    }

    fn drain(&mut self) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        loop {
            if self.done {
                break;
            }

            let trimmed = self.buffer.trim_start_matches(['\n', '\r']);
            let skipped = self.buffer.len() - trimmed.len();
            if skipped > 0 {
                self.buffer.drain(..skipped);
            }
            if self.buffer.is_empty() {
                break;
            }

            if let Some(rest) = self.buffer.strip_prefix("[DONE]") {
                let consumed = self.buffer.len() - rest.len();
                self.buffer.drain(..consumed);
                self.flush_as_complete(&mut events);
                events.push(ParsedEvent::Done);
                self.done = true;
                break;
            }

            if contains_cloudflare_marker(&self.buffer) {
                events.push(ParsedEvent::CaptchaPending);
                self.buffer.clear();
                break;
            }

            if let Some((tag, value, consumed)) = next_tagged_frame(&self.buffer) {
                self.buffer.drain(..consumed);
                self.apply_frame(tag, value, &mut events);
                continue;
            }

            if self.buffer.starts_with('{') {
                match parse_leading_value(&self.buffer) {
                    Some((value, consumed)) => {
                        self.buffer.drain(..consumed);
                        if let Some(msg) = value.get("error") {
                            let raw = msg.as_str().map(str::to_owned).unwrap_or_else(|| msg.to_string());
                            events.push(ParsedEvent::Error(friendly_error_message(&raw)));
                        }
                        continue;
                    }
                    None => break,
                }
            }

            // Unrecognized leading bytes with no complete frame yet; wait for more data.
            break;
        }
        events
    }

    fn apply_frame(&mut self, tag: &str, value: serde_json::Value, events: &mut Vec<ParsedEvent>) {
        match tag {
            "a0" | "b0" => {
                let text = value.as_str().unwrap_or_default().to_owned();
                self.finish_pending_reasoning(events);
                events.push(ParsedEvent::Content(text));
            }
            "ag" => {
                let text = value.as_str().unwrap_or_default().to_owned();
                self.reasoning_active = true;
                self.reasoning_accum.push_str(&text);
                events.push(ParsedEvent::Reasoning(text));
            }
            "a2" | "b2" => {
                let urls = value
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("image"))
                            .filter_map(|item| item.get("image").and_then(|u| u.as_str()))
                            .map(str::to_owned)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if !urls.is_empty() {
                    events.push(ParsedEvent::Images(urls));
                }
            }
            "ad" | "bd" => {
                let reason = value.get("finishReason").and_then(|v| v.as_str()).unwrap_or("stop").to_owned();
                events.push(ParsedEvent::Finish(reason));
            }
            _ => {}
        }
    }

    /// Content is about to follow pending reasoning: emit `reasoning_end`.
    fn finish_pending_reasoning(&mut self, events: &mut Vec<ParsedEvent>) {
        if !self.reasoning_active {
            return;
        }
        self.reasoning_active = false;
        events.push(ParsedEvent::ReasoningEnd);
        self.reasoning_accum.clear();
    }

    /// The stream is terminating with no content ever following the
    /// reasoning: emit `reasoning_complete` with the full concatenation.
    fn flush_as_complete(&mut self, events: &mut Vec<ParsedEvent>) {
        if !self.reasoning_active {
            return;
        }
        self.reasoning_active = false;
        events.push(ParsedEvent::ReasoningComplete(std::mem::take(&mut self.reasoning_accum)));
    }
}

fn contains_cloudflare_marker(buffer: &str) -> bool {
    CLOUDFLARE_MARKERS.iter().any(|marker| buffer.contains(marker))
}

/// Match the tag prefix at the start of `buffer` and parse the JSON value
/// following its colon, using a streaming deserializer so nested
/// objects/arrays (e.g. a `finishReason` payload with extra keys) are
/// consumed correctly without hand-rolled bracket matching.
fn next_tagged_frame(buffer: &str) -> Option<(&'static str, serde_json::Value, usize)> {
    let caps = TAG.captures(buffer)?;
    let whole = caps.get(0)?;
    let tag = match &caps[1] {
        "a0" => "a0",
        "b0" => "b0",
        "ag" => "ag",
        "a2" => "a2",
        "b2" => "b2",
        "ad" => "ad",
        "bd" => "bd",
        _ => return None,
    };
    let rest = &buffer[whole.end()..];
    let (value, value_len) = parse_leading_value(rest)?;
    Some((tag, value, whole.end() + value_len))
}

/// Parse one JSON value from the start of `text`, returning it with the
/// number of bytes it consumed. `None` if `text` is not yet a complete value
/// (caller should wait for more data).
fn parse_leading_value(text: &str) -> Option<(serde_json::Value, usize)> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<serde_json::Value>();
    match stream.next() {
        Some(Ok(value)) => Some((value, stream.byte_offset())),
        _ => None,
    }
}

/// Map a raw upstream error string to a client-facing message, per the
/// documented kinds (oversized-payload errors in particular get a clearer
/// label than the raw upstream text).
fn friendly_error_message(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("413") || lower.contains("too large") || lower.contains("payload") {
        "attachment too large for upstream".to_owned()
    } else {
        raw.to_owned()
    }
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
