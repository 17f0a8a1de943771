//! The closed set of tools the model may call, with typed arguments.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    OpenUrl,
    SnapshotDom,
    ClickTarget,
    WaitForNavigation,
    GetCurrentUrl,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        Self::OpenUrl,
        Self::SnapshotDom,
        Self::ClickTarget,
        Self::WaitForNavigation,
        Self::GetCurrentUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenUrl => "open_url",
            Self::SnapshotDom => "snapshot_dom",
            Self::ClickTarget => "click_target",
            Self::WaitForNavigation => "wait_for_navigation",
            Self::GetCurrentUrl => "get_current_url",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name.trim())
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::OpenUrl => "Open a URL in the browser. Starts the browser on first use.",
            Self::SnapshotDom => {
                "List the visible clickable elements (links, buttons, clickable controls) on the current page in reading order."
            }
            Self::ClickTarget => {
                "Click the element that best matches a target phrase, falling back to synonyms when the phrase does not appear verbatim."
            }
            Self::WaitForNavigation => {
                "Wait for the page to settle after an action and report what changed: full-navigation, url-change, title-change, same-page-update, spa-navigation or none."
            }
            Self::GetCurrentUrl => "Return the current page URL and title.",
        }
    }

    /// JSON schema of this tool's arguments.
    pub fn parameters(&self) -> Value {
        let schema = match self {
            Self::OpenUrl => schemars::schema_for!(OpenUrlArgs),
            Self::SnapshotDom => schemars::schema_for!(SnapshotArgs),
            Self::ClickTarget => schemars::schema_for!(ClickTargetArgs),
            Self::WaitForNavigation => schemars::schema_for!(WaitArgs),
            Self::GetCurrentUrl => schemars::schema_for!(GetUrlArgs),
        };
        let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}));
        if let Some(obj) = value.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
            obj.entry("properties").or_insert_with(|| json!({}));
        }
        value
    }

    /// OpenAI-style function declaration.
    pub fn function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.as_str(),
                "description": self.description(),
                "parameters": self.parameters(),
            }
        })
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct OpenUrlArgs {
    /// Absolute http(s) URL to open.
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, JsonSchema)]
pub struct SnapshotArgs {
    /// Return at most this many elements.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct ClickTargetArgs {
    /// Visible text of the element to click, e.g. "Pay Bill".
    pub target: String,
    /// Alternative wordings to try when the target text is not on the page.
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, JsonSchema)]
pub struct WaitArgs {
    /// Upper bound in milliseconds for each completion signal.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, JsonSchema)]
pub struct GetUrlArgs {}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    OpenUrl(OpenUrlArgs),
    SnapshotDom(SnapshotArgs),
    ClickTarget(ClickTargetArgs),
    WaitForNavigation(WaitArgs),
    GetCurrentUrl(GetUrlArgs),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvocationError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: ToolName, message: String },
}

fn decode<T: DeserializeOwned>(tool: ToolName, raw: &str) -> Result<T, InvocationError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| InvocationError::InvalidArguments {
        tool,
        message: e.to_string(),
    })
}

fn invalid(tool: ToolName, message: &str) -> InvocationError {
    InvocationError::InvalidArguments {
        tool,
        message: message.to_string(),
    }
}

impl ToolInvocation {
    /// Decode a model-emitted call. `raw_args` is the JSON text as emitted.
    pub fn parse(name: &str, raw_args: &str) -> Result<Self, InvocationError> {
        let tool = ToolName::parse(name).ok_or_else(|| InvocationError::UnknownTool(name.to_string()))?;
        let invocation = match tool {
            ToolName::OpenUrl => {
                let mut args: OpenUrlArgs = decode(tool, raw_args)?;
                args.url = args.url.trim().to_string();
                let parsed = url::Url::parse(&args.url).map_err(|e| invalid(tool, &format!("url: {}", e)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(invalid(tool, "url must use http or https"));
                }
                Self::OpenUrl(args)
            }
            ToolName::SnapshotDom => Self::SnapshotDom(decode(tool, raw_args)?),
            ToolName::ClickTarget => {
                let mut args: ClickTargetArgs = decode(tool, raw_args)?;
                args.target = args.target.trim().to_string();
                if args.target.is_empty() {
                    return Err(invalid(tool, "target must not be empty"));
                }
                args.synonyms.retain(|s| !s.trim().is_empty());
                Self::ClickTarget(args)
            }
            ToolName::WaitForNavigation => Self::WaitForNavigation(decode(tool, raw_args)?),
            ToolName::GetCurrentUrl => Self::GetCurrentUrl(decode(tool, raw_args)?),
        };
        Ok(invocation)
    }

    pub fn name(&self) -> ToolName {
        match self {
            Self::OpenUrl(_) => ToolName::OpenUrl,
            Self::SnapshotDom(_) => ToolName::SnapshotDom,
            Self::ClickTarget(_) => ToolName::ClickTarget,
            Self::WaitForNavigation(_) => ToolName::WaitForNavigation,
            Self::GetCurrentUrl(_) => ToolName::GetCurrentUrl,
        }
    }
}
