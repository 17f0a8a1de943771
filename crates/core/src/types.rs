use serde::{Deserialize, Serialize};

/// A tool call request that serializes to the OpenAI-compatible format:
/// `{id, type: "function", function: {name, arguments}}`
///
/// `arguments` is the raw JSON text produced by the model. It is only parsed
/// when the call is dispatched, so malformed arguments surface as a tool error
/// the model can correct instead of being silently replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl Serialize for ToolCallRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &serde_json::json!({
            "name": self.name,
            "arguments": self.arguments,
        }))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ToolCallRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value.as_object().ok_or_else(|| serde::de::Error::custom("expected object"))?;

        let id = obj.get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Nested format: {id, type, function: {name, arguments}}, else flat {id, name, arguments}
        let source = obj.get("function").and_then(|v| v.as_object()).unwrap_or(obj);
        let name = source.get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let arguments = match source.get("arguments") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => "{}".to_string(),
        };

        Ok(ToolCallRequest { id, name, arguments })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
}

/// Incremental output forwarded while a streamed completion is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    /// A tool call began streaming; its arguments are still being assembled.
    ToolCallStarted { index: usize, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: serde_json::Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role("assistant", content)
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        let mut msg = Self::with_role("tool", content);
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg
    }

    pub fn text(&self) -> &str {
        self.content.as_str().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_serializes_openai_shape() {
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "click_target".to_string(),
            arguments: r#"{"target":"Pay Bill"}"#.to_string(),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "click_target");
        assert_eq!(value["function"]["arguments"], r#"{"target":"Pay Bill"}"#);
    }

    #[test]
    fn test_tool_call_keeps_malformed_arguments_verbatim() {
        let raw = r#"{"id":"c","type":"function","function":{"name":"open_url","arguments":"{\"url\": "}}"#;
        let call: ToolCallRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(call.name, "open_url");
        assert_eq!(call.arguments, r#"{"url": "#);
    }

    #[test]
    fn test_tool_call_flat_format_with_object_arguments() {
        let raw = r#"{"id":"c","name":"get_current_url","arguments":{}}"#;
        let call: ToolCallRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(call.name, "get_current_url");
        assert_eq!(call.arguments, "{}");
    }

    #[test]
    fn test_tool_result_message() {
        let msg = ChatMessage::tool_result("call_9", r#"{"ok":true}"#);
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(msg.text(), r#"{"ok":true}"#);
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("tool_calls").is_none());
    }
}
