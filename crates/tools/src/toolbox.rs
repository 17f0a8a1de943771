//! Tool execution against one explicitly owned browser session.
//!
//! [`Toolbox::dispatch`] is the only entry the control loop uses. It never
//! returns an error: every outcome, including failures inside the browser, is
//! rendered as a JSON envelope with an `ok` field.

use paynav_core::{Config, Error, NavigationConfig, ResolverWeights, Result, SnapshotConfig};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::navigation::{self, Baseline};
use crate::browser::page::{current_title, current_url, PageLauncher};
use crate::browser::{resolver, snapshot, BrowserSession};
use crate::invocation::{InvocationError, ToolInvocation, ToolName};

/// Result of one tool call. `text` is always a valid JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub ok: bool,
    pub text: String,
    /// The call itself was unusable: unknown tool or bad arguments.
    pub invalid_call: bool,
}

impl ToolOutput {
    fn from_envelope(envelope: Value, invalid_call: bool) -> Self {
        let ok = envelope.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
        Self {
            ok,
            text: envelope.to_string(),
            invalid_call,
        }
    }

    pub fn failure(error: &str) -> Self {
        Self::from_envelope(json!({"ok": false, "error": error}), false)
    }

    pub fn cancelled() -> Self {
        Self::failure("cancelled")
    }
}

/// Merge `payload` into an envelope. A payload that already carries `ok`
/// keeps it.
fn envelope<T: Serialize>(ok: bool, payload: &T) -> Result<Value> {
    let mut map = match serde_json::to_value(payload)? {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    };
    map.entry("ok").or_insert(Value::Bool(ok));
    Ok(Value::Object(map))
}

fn error_envelope(err: &Error) -> Value {
    match err {
        Error::NoMatch { target, synonyms } => json!({
            "ok": false,
            "error": "no match",
            "target": target,
            "synonyms": synonyms,
        }),
        other => json!({"ok": false, "error": other.to_string()}),
    }
}

fn invocation_error_envelope(err: &InvocationError) -> Value {
    match err {
        InvocationError::UnknownTool(_) => json!({
            "ok": false,
            "error": err.to_string(),
            "availableTools": ToolName::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        }),
        InvocationError::InvalidArguments { tool, .. } => json!({
            "ok": false,
            "error": err.to_string(),
            "tool": tool.as_str(),
        }),
    }
}

pub struct Toolbox {
    session: BrowserSession,
    snapshot: SnapshotConfig,
    resolver: ResolverWeights,
    navigation: NavigationConfig,
    click_timeout: Duration,
    /// State recorded before the last click or open, consumed by the next wait.
    baseline: Option<Baseline>,
}

impl Toolbox {
    pub fn new(launcher: Arc<dyn PageLauncher>, config: &Config) -> Self {
        Self {
            session: BrowserSession::new(launcher, Duration::from_millis(config.browser.navigation_timeout_ms)),
            snapshot: config.snapshot.clone(),
            resolver: config.resolver.clone(),
            navigation: config.navigation.clone(),
            click_timeout: Duration::from_millis(config.browser.click_timeout_ms),
            baseline: None,
        }
    }

    /// Function declarations advertised to the model.
    pub fn schemas() -> Vec<Value> {
        ToolName::ALL.iter().map(|t| t.function_schema()).collect()
    }

    pub async fn dispatch(&mut self, name: &str, raw_args: &str) -> ToolOutput {
        match ToolInvocation::parse(name, raw_args) {
            Ok(invocation) => self.invoke(invocation).await,
            Err(e) => {
                warn!(tool = %name, error = %e, "Rejected tool call");
                ToolOutput::from_envelope(invocation_error_envelope(&e), true)
            }
        }
    }

    pub async fn invoke(&mut self, invocation: ToolInvocation) -> ToolOutput {
        let tool = invocation.name();
        let requested_url = match &invocation {
            ToolInvocation::OpenUrl(args) => Some(args.url.clone()),
            _ => None,
        };
        debug!(tool = %tool, args = ?invocation, "Executing tool");
        match self.run(invocation).await {
            Ok(envelope) => ToolOutput::from_envelope(envelope, false),
            Err(e) => {
                warn!(tool = %tool, error = %e, "Tool failed");
                if e.is_session_error() {
                    self.baseline = None;
                    self.session.invalidate().await;
                }
                let mut envelope = error_envelope(&e);
                if let (Some(url), Some(map)) = (requested_url, envelope.as_object_mut()) {
                    map.insert("url".to_string(), Value::String(url));
                }
                ToolOutput::from_envelope(envelope, false)
            }
        }
    }

    async fn run(&mut self, invocation: ToolInvocation) -> Result<Value> {
        match invocation {
            ToolInvocation::OpenUrl(args) => {
                self.baseline = self.capture_baseline().await;
                let outcome = self.session.open(&args.url).await?;
                if !outcome.ok {
                    self.baseline = None;
                }
                envelope(outcome.ok, &outcome)
            }
            ToolInvocation::SnapshotDom(args) => {
                let page = self.session.page().await?;
                let mut elements = snapshot::capture(page.as_ref(), &self.snapshot).await?;
                if let Some(limit) = args.limit {
                    elements.truncate(limit);
                }
                Ok(json!({
                    "ok": true,
                    "url": current_url(page.as_ref()).await?,
                    "title": current_title(page.as_ref()).await?,
                    "count": elements.len(),
                    "elements": elements,
                }))
            }
            ToolInvocation::ClickTarget(args) => {
                let page = self.session.page().await?;
                self.baseline = self.capture_baseline().await;
                let result = resolver::click_target(
                    page.as_ref(),
                    &args.target,
                    &args.synonyms,
                    &self.snapshot,
                    &self.resolver,
                    self.click_timeout,
                )
                .await;
                match result {
                    Ok(outcome) => envelope(true, &outcome),
                    Err(e) => {
                        self.baseline = None;
                        Err(e)
                    }
                }
            }
            ToolInvocation::WaitForNavigation(args) => {
                let page = self.session.page().await?;
                let cap = args.timeout_ms.map(Duration::from_millis);
                let outcome =
                    navigation::wait_for_navigation(page.as_ref(), self.baseline.take(), &self.navigation, cap).await?;
                envelope(true, &outcome)
            }
            ToolInvocation::GetCurrentUrl(_) => {
                let page = self.session.page().await?;
                Ok(json!({
                    "ok": true,
                    "url": current_url(page.as_ref()).await?,
                    "title": current_title(page.as_ref()).await?,
                }))
            }
        }
    }

    async fn capture_baseline(&mut self) -> Option<Baseline> {
        let page = self.session.page().await.ok()?;
        match navigation::capture_baseline(page.as_ref()).await {
            Ok(b) => Some(b),
            Err(e) => {
                debug!(error = %e, "Could not record navigation baseline");
                None
            }
        }
    }

    /// URL and title of the live page, without launching a browser.
    pub async fn current_location(&mut self) -> Option<(String, Option<String>)> {
        if !self.session.is_live() {
            return None;
        }
        let page = self.session.page().await.ok()?;
        let url = current_url(page.as_ref()).await.ok()?;
        let title = current_title(page.as_ref()).await.ok().filter(|t| !t.is_empty());
        Some((url, title))
    }

    pub async fn cleanup(&mut self) {
        self.baseline = None;
        self.session.cleanup().await;
        info!("Toolbox cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::page::LoadSignal;
    use crate::browser::testing::{FailingLauncher, FakeLauncher, FakePage};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.navigation.network_idle_timeout_ms = 150;
        config.navigation.dom_ready_timeout_ms = 150;
        config.navigation.url_change_timeout_ms = 150;
        config.navigation.title_change_timeout_ms = 150;
        config.navigation.poll_interval_ms = 10;
        config.browser.click_timeout_ms = 500;
        config
    }

    fn toolbox(page: Arc<FakePage>) -> (Toolbox, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::new(page));
        (Toolbox::new(launcher.clone(), &test_config()), launcher)
    }

    fn parse(output: &ToolOutput) -> Value {
        serde_json::from_str(&output.text).expect("tool output must be JSON")
    }

    fn utility_home() -> Arc<FakePage> {
        let page = Arc::new(FakePage::new("about:blank", ""));
        page.on_goto("https://util.example.com/", "https://util.example.com/home", "City Utilities");
        page.add_element("My Account", "a", Some("https://util.example.com/account"), 20.0);
        page.add_element("Pay Bill", "a", Some("https://util.example.com/pay"), 60.0);
        page.add_element("Contact Us", "a", Some("https://util.example.com/contact"), 400.0);
        page
    }

    #[tokio::test]
    async fn test_first_call_initializes_session() {
        let page = utility_home();
        let (mut tools, launcher) = toolbox(page.clone());
        assert_eq!(launcher.launch_count(), 0);

        let out = tools.dispatch("get_current_url", "{}").await;
        assert!(out.ok);
        assert_eq!(parse(&out)["url"], "about:blank");
        tools.dispatch("get_current_url", "{}").await;
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_open_snapshot_click_wait_flow() {
        let page = utility_home();
        page.on_click("Pay Bill", "https://util.example.com/pay", "Pay Your Bill");
        page.fire_signal(LoadSignal::DomContentLoaded, Duration::from_millis(5));
        let (mut tools, _) = toolbox(page.clone());

        let open = parse(&tools.dispatch("open_url", r#"{"url":"https://util.example.com/"}"#).await);
        assert_eq!(open["ok"], true);
        assert_eq!(open["finalUrl"], "https://util.example.com/home");

        let snap = parse(&tools.dispatch("snapshot_dom", r#"{"limit":2}"#).await);
        assert_eq!(snap["count"], 2);
        assert_eq!(snap["elements"][0]["text"], "My Account");
        assert_eq!(snap["elements"][1]["tagKind"], "link");

        let click = parse(
            &tools
                .dispatch("click_target", r#"{"target":"Pay Bill","synonyms":["payment","billing"]}"#)
                .await,
        );
        assert_eq!(click["ok"], true);
        assert_eq!(click["clickedText"], "Pay Bill");
        assert_eq!(click["score"], 100);

        let wait = parse(&tools.dispatch("wait_for_navigation", "{}").await);
        assert_eq!(wait["ok"], true);
        assert_eq!(wait["classification"], "full-navigation");
        assert_eq!(wait["initialUrl"], "https://util.example.com/home");
        assert_eq!(wait["finalUrl"], "https://util.example.com/pay");
    }

    #[tokio::test]
    async fn test_no_match_is_structured() {
        let page = utility_home();
        let (mut tools, _) = toolbox(page);
        tools.dispatch("open_url", r#"{"url":"https://util.example.com/"}"#).await;

        let out = tools
            .dispatch("click_target", r#"{"target":"Guest Pay","synonyms":["pay as guest"]}"#)
            .await;
        assert!(!out.ok);
        assert!(!out.invalid_call);
        let value = parse(&out);
        assert_eq!(value["error"], "no match");
        assert_eq!(value["target"], "Guest Pay");
        assert_eq!(value["synonyms"], json!(["pay as guest"]));
    }

    #[tokio::test]
    async fn test_invalid_calls_are_flagged() {
        let (mut tools, launcher) = toolbox(utility_home());

        let unknown = tools.dispatch("submit_payment", "{}").await;
        assert!(unknown.invalid_call);
        assert_eq!(parse(&unknown)["availableTools"].as_array().unwrap().len(), 5);

        let malformed = tools.dispatch("open_url", r#"{"url": "#).await;
        assert!(malformed.invalid_call);
        assert!(!malformed.ok);
        assert_eq!(parse(&malformed)["tool"], "open_url");

        // Rejected calls never touch the browser
        assert_eq!(launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_envelope_names_url() {
        let page = utility_home();
        page.fail_next_goto(Error::Timeout("navigation timed out".to_string()));
        let (mut tools, _) = toolbox(page);

        let out = tools.dispatch("open_url", r#"{"url":"https://slow.example.com/"}"#).await;
        assert!(!out.ok);
        let value = parse(&out);
        assert_eq!(value["url"], "https://slow.example.com/");
        assert!(value["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_session_error_reinitializes_on_next_call() {
        let page = utility_home();
        let (mut tools, launcher) = toolbox(page.clone());
        tools.dispatch("get_current_url", "{}").await;

        page.break_session();
        let out = tools.dispatch("snapshot_dom", "{}").await;
        assert!(!out.ok);
        assert!(parse(&out)["error"].as_str().unwrap().contains("disconnected"));
        assert_eq!(page.close_count(), 1);

        page.restore_session();
        let out = tools.dispatch("get_current_url", "{}").await;
        assert!(out.ok);
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_launch_failure_is_an_envelope() {
        let mut tools = Toolbox::new(Arc::new(FailingLauncher), &test_config());
        for tool in ToolName::ALL {
            let args = match tool {
                ToolName::OpenUrl => r#"{"url":"https://util.example.com/"}"#,
                ToolName::ClickTarget => r#"{"target":"Pay"}"#,
                _ => "{}",
            };
            let out = tools.dispatch(tool.as_str(), args).await;
            assert!(!out.ok, "{tool} should fail");
            let value = parse(&out);
            assert_eq!(value["ok"], false);
            assert!(value["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_open_session_error_names_url() {
        let mut tools = Toolbox::new(Arc::new(FailingLauncher), &test_config());
        let out = tools.dispatch("open_url", r#"{"url":"https://util.example.com/"}"#).await;
        let value = parse(&out);
        assert_eq!(value["ok"], false);
        assert_eq!(value["url"], "https://util.example.com/");
        assert!(value["error"].as_str().unwrap().contains("Chrome not found"));

        let page = utility_home();
        let (mut tools, _) = toolbox(page.clone());
        tools.dispatch("get_current_url", "{}").await;
        page.break_session();
        let out = tools.dispatch("open_url", r#"{"url":"https://util.example.com/pay"}"#).await;
        let value = parse(&out);
        assert_eq!(value["url"], "https://util.example.com/pay");
        assert!(value["error"].as_str().unwrap().contains("disconnected"));

        // Other tools keep their plain error shape
        page.restore_session();
        let out = tools.dispatch("get_current_url", "{}").await;
        assert!(out.ok);
        page.break_session();
        let out = tools.dispatch("snapshot_dom", "{}").await;
        assert!(parse(&out).get("url").is_none());
    }

    #[tokio::test]
    async fn test_cleanup_twice_and_before_use() {
        let page = utility_home();
        let (mut tools, _) = toolbox(page.clone());
        tools.cleanup().await;
        tools.dispatch("get_current_url", "{}").await;
        tools.cleanup().await;
        tools.cleanup().await;
        assert_eq!(page.close_count(), 1);
        assert!(tools.current_location().await.is_none());
    }

    #[test]
    fn test_schemas_cover_all_tools() {
        let names: Vec<String> = Toolbox::schemas()
            .iter()
            .map(|s| s["function"]["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["open_url", "snapshot_dom", "click_target", "wait_for_navigation", "get_current_url"]
        );
    }
}
