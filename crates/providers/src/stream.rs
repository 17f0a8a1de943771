//! Server-sent event decoding and incremental assembly of streamed
//! chat-completion chunks.

use bytes::BytesMut;
use paynav_core::{LLMResponse, StreamDelta, ToolCallRequest};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into SSE `data:` payloads. Chunks may end anywhere,
/// including inside a multi-byte character.
#[derive(Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = self.buffer.split();
        let line = String::from_utf8_lossy(&rest);
        parse_line(line.trim())
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data.to_string()))
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates `choices[0].delta` fragments. Tool calls are keyed by their
/// stream index and only handed out by [`ToolCallAssembler::finish`].
#[derive(Default)]
pub struct ToolCallAssembler {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
    finish_reason: Option<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one decoded chunk, returning deltas to forward to the caller.
    pub fn apply(&mut self, chunk: &Value) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return deltas;
        };

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish_reason = Some(reason.to_string());
        }

        let Some(delta) = choice.get("delta") else {
            return deltas;
        };

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                self.content.push_str(text);
                deltas.push(StreamDelta::Text(text.to_string()));
            }
        }

        for (pos, tc) in delta
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .enumerate()
        {
            let index = tc.get("index").and_then(|v| v.as_u64()).map_or(pos, |i| i as usize);
            let call = self.calls.entry(index).or_default();
            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                if call.id.is_empty() {
                    call.id = id.to_string();
                }
            }
            let function = tc.get("function");
            if let Some(name) = function.and_then(|f| f.get("name")).and_then(|v| v.as_str()) {
                if call.name.is_empty() && !name.is_empty() {
                    call.name = name.to_string();
                    deltas.push(StreamDelta::ToolCallStarted {
                        index,
                        name: name.to_string(),
                    });
                }
            }
            if let Some(args) = function.and_then(|f| f.get("arguments")).and_then(|v| v.as_str()) {
                call.arguments.push_str(args);
            }
        }
        deltas
    }

    pub fn finish(self) -> LLMResponse {
        let tool_calls: Vec<ToolCallRequest> = self
            .calls
            .into_iter()
            .filter_map(|(index, call)| {
                if call.name.is_empty() {
                    warn!(index, "Dropping streamed tool call without a name");
                    return None;
                }
                Some(ToolCallRequest {
                    id: if call.id.is_empty() {
                        format!("call_{}", index)
                    } else {
                        call.id
                    },
                    name: call.name,
                    arguments: call.arguments,
                })
            })
            .collect();

        let finish_reason = self.finish_reason.unwrap_or_else(|| {
            if tool_calls.is_empty() { "stop" } else { "tool_calls" }.to_string()
        });
        LLMResponse {
            content: (!self.content.is_empty()).then_some(self.content),
            tool_calls,
            finish_reason,
        }
    }
}
