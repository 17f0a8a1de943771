use async_trait::async_trait;
use futures::StreamExt;
use paynav_core::{ChatMessage, Error, LLMResponse, ProviderConfig, Result, StreamDelta, ToolCallRequest};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::build_http_client;
use crate::stream::{SseDecoder, SseEvent, ToolCallAssembler};
use crate::Provider;

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Streaming client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAIProvider {
    pub fn new(api_key: &str, api_base: Option<&str>, model: &str, max_tokens: u32, temperature: f32) -> Self {
        Self::with_client(
            build_http_client(None, api_base.unwrap_or("https://api.openai.com/v1"), Duration::from_secs(120)),
            api_key,
            api_base,
            model,
            max_tokens,
            temperature,
        )
    }

    pub fn from_config(config: &ProviderConfig, api_key: &str) -> Self {
        let client = build_http_client(
            config.proxy.as_deref(),
            &config.api_base,
            Duration::from_secs(config.request_timeout_secs),
        );
        Self::with_client(
            client,
            api_key,
            Some(&config.api_base),
            &config.model,
            config.max_tokens,
            config.temperature,
        )
    }

    fn with_client(
        client: Client,
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        let resolved_base = api_base
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();
        Self {
            client,
            api_key: api_key.to_string(),
            api_base: resolved_base,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    /// Parse `<tool_call>{"name":"...","arguments":{...}}</tool_call>` blocks
    /// out of plain text. Returns (remaining_text, parsed_tool_calls).
    pub fn parse_text_tool_calls(content: &str) -> (String, Vec<ToolCallRequest>) {
        let mut tool_calls = Vec::new();
        let mut remaining = String::new();
        let mut rest = content;

        while let Some(start) = rest.find("<tool_call>") {
            remaining.push_str(&rest[..start]);
            let after_tag = &rest[start + "<tool_call>".len()..];
            let Some(end) = after_tag.find("</tool_call>") else {
                remaining.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let json_str = after_tag[..end].trim();
            match serde_json::from_str::<Value>(json_str) {
                Ok(val) => {
                    let name = val
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let arguments = match val.get("arguments") {
                        Some(Value::String(s)) => s.clone(),
                        Some(v) => v.to_string(),
                        None => "{}".to_string(),
                    };
                    tool_calls.push(ToolCallRequest {
                        id: format!("text_call_{}", tool_calls.len()),
                        name,
                        arguments,
                    });
                }
                Err(_) => {
                    warn!(json = %json_str, "Failed to parse tool_call JSON");
                    remaining.push_str(&rest[start..start + "<tool_call>".len() + end + "</tool_call>".len()]);
                }
            }
            rest = &after_tag[end + "</tool_call>".len()..];
        }
        remaining.push_str(rest);

        (remaining.trim().to_string(), tool_calls)
    }

    async fn open_stream(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_base);
        let request = ChatRequest {
            model: &self.model,
            messages,
            tools,
            tool_choice: (!tools.is_empty()).then_some("auto"),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: true,
        };

        info!(url = %url, model = %self.model, tools_count = tools.len(), messages_count = messages.len(), "Calling LLM");

        let request_body = serde_json::to_string(&request)
            .map_err(|e| Error::Provider(format!("Failed to serialize request: {}", e)))?;
        debug!(body_len = request_body.len(), "Request body prepared");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .body(request_body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let raw_body = response.text().await.unwrap_or_default();
            let end = truncate_at_char_boundary(&raw_body, 500);
            error!(status = %status, body = %&raw_body[..end], "LLM API error");
            return Err(Error::Provider(format!("API error {}: {}", status, &raw_body[..end])));
        }
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

async fn forward(deltas: &mpsc::Sender<StreamDelta>, items: Vec<StreamDelta>) {
    for item in items {
        // A dropped receiver only means nobody is watching the stream.
        let _ = deltas.send(item).await;
    }
}

fn decode_chunk(data: &str) -> Result<Option<Value>> {
    let value = match serde_json::from_str::<Value>(data) {
        Ok(v) => v,
        Err(e) => {
            let end = truncate_at_char_boundary(data, 200);
            warn!(error = %e, chunk = %&data[..end], "Skipping undecodable stream chunk");
            return Ok(None);
        }
    };
    if let Some(err) = value.get("error") {
        return Err(Error::Provider(format!("stream error: {}", err)));
    }
    Ok(Some(value))
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        deltas: mpsc::Sender<StreamDelta>,
    ) -> Result<LLMResponse> {
        let response = self.open_stream(messages, tools).await?;
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut assembler = ToolCallAssembler::new();

        'read: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Provider(format!("Stream interrupted: {}", e)))?;
            for event in decoder.push(&chunk) {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(data) => {
                        if let Some(value) = decode_chunk(&data)? {
                            forward(&deltas, assembler.apply(&value)).await;
                        }
                    }
                }
            }
        }
        if let Some(SseEvent::Data(data)) = decoder.finish() {
            if let Some(value) = decode_chunk(&data)? {
                forward(&deltas, assembler.apply(&value)).await;
            }
        }

        let mut response = assembler.finish();
        if response.tool_calls.is_empty() && !tools.is_empty() {
            if let Some(content) = response.content.as_deref().filter(|c| c.contains("<tool_call>")) {
                let (remaining, parsed) = Self::parse_text_tool_calls(content);
                if !parsed.is_empty() {
                    info!(count = parsed.len(), "Parsed text-based tool calls");
                    response.content = (!remaining.is_empty()).then_some(remaining);
                    response.tool_calls = parsed;
                    response.finish_reason = "tool_calls".to_string();
                }
            }
        }

        debug!(
            content_len = response.content.as_ref().map_or(0, |c| c.len()),
            tool_calls = response.tool_calls.len(),
            finish_reason = %response.finish_reason,
            "LLM stream complete"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response and return the request body it received.
    async fn serve_once(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            let (header_end, content_len) = loop {
                let n = socket.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(pos) = text.find("\r\n\r\n") {
                    let len = text[..pos]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    break (pos + 4, len);
                }
            };
            while buf.len() < header_end + content_len {
                let n = socket.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{}",
                status, body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[header_end..]).to_string()
        });
        (base, handle)
    }

    fn sse(chunks: &[Value]) -> String {
        let mut body: String = chunks.iter().map(|c| format!("data: {}\n\n", c)).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn test_parse_xml_tool_call() {
        let content = "Let me look.\n<tool_call>\n{\"name\": \"snapshot_dom\", \"arguments\": {\"limit\": 20}}\n</tool_call>";
        let (remaining, calls) = OpenAIProvider::parse_text_tool_calls(content);
        assert_eq!(remaining, "Let me look.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "snapshot_dom");
        assert_eq!(calls[0].arguments, r#"{"limit":20}"#);
    }

    #[test]
    fn test_parse_text_tool_call_keeps_broken_blocks() {
        let content = "<tool_call>{not json}</tool_call> trailing <tool_call>unterminated";
        let (remaining, calls) = OpenAIProvider::parse_text_tool_calls(content);
        assert!(calls.is_empty());
        assert!(remaining.contains("{not json}"));
        assert!(remaining.ends_with("unterminated"));
    }

    #[tokio::test]
    async fn test_chat_stream_forwards_text_and_assembles_calls() {
        let body = sse(&[
            serde_json::json!({"choices":[{"delta":{"content":"Checking "}}]}),
            serde_json::json!({"choices":[{"delta":{"content":"the page."}}]}),
            serde_json::json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"click_target","arguments":"{\"target\":"}}]}}]}),
            serde_json::json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Pay Bill\"}"}}]}}]}),
            serde_json::json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}),
        ]);
        let (base, server) = serve_once("200 OK", body).await;
        let provider = OpenAIProvider::new("sk-test", Some(&base), "gpt-test", 256, 0.0);

        let (tx, mut rx) = mpsc::channel(32);
        let tools = vec![serde_json::json!({"type":"function","function":{"name":"click_target"}})];
        let response = provider
            .chat_stream(&[ChatMessage::user("go")], &tools, tx)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(d) = rx.recv().await {
            seen.push(d);
        }
        assert_eq!(
            seen,
            vec![
                StreamDelta::Text("Checking ".to_string()),
                StreamDelta::Text("the page.".to_string()),
                StreamDelta::ToolCallStarted {
                    index: 0,
                    name: "click_target".to_string()
                },
            ]
        );
        assert_eq!(response.content.as_deref(), Some("Checking the page."));
        assert_eq!(response.tool_calls[0].arguments, r#"{"target":"Pay Bill"}"#);

        let request: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(request["stream"], true);
        assert_eq!(request["tool_choice"], "auto");
        assert_eq!(request["model"], "gpt-test");
    }

    #[tokio::test]
    async fn test_chat_stream_text_tool_call_fallback() {
        let body = sse(&[serde_json::json!({"choices":[{"delta":{"content":"<tool_call>{\"name\":\"get_current_url\",\"arguments\":{}}</tool_call>"},"finish_reason":"stop"}]})]);
        let (base, _server) = serve_once("200 OK", body).await;
        let provider = OpenAIProvider::new("sk-test", Some(&base), "gpt-test", 256, 0.0);

        let (tx, _rx) = mpsc::channel(32);
        let tools = vec![serde_json::json!({"type":"function"})];
        let response = provider.chat_stream(&[ChatMessage::user("go")], &tools, tx).await.unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "get_current_url");
        assert!(response.content.is_none());
        assert_eq!(response.finish_reason, "tool_calls");
    }

    #[tokio::test]
    async fn test_chat_stream_http_error() {
        let (base, _server) = serve_once("401 Unauthorized", "{\"error\":\"bad key\"}".to_string()).await;
        let provider = OpenAIProvider::new("sk-bad", Some(&base), "gpt-test", 256, 0.0);
        let (tx, _rx) = mpsc::channel(4);
        let err = provider.chat_stream(&[ChatMessage::user("go")], &[], tx).await.unwrap_err();
        match err {
            Error::Provider(msg) => assert!(msg.contains("401")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chat_stream_error_event() {
        let body = "data: {\"error\":{\"message\":\"overloaded\"}}\n\n".to_string();
        let (base, _server) = serve_once("200 OK", body).await;
        let provider = OpenAIProvider::new("sk-test", Some(&base), "gpt-test", 256, 0.0);
        let (tx, _rx) = mpsc::channel(4);
        let err = provider.chat_stream(&[ChatMessage::user("go")], &[], tx).await.unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }
}
