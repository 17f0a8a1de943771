//! The model control loop.
//!
//! One run is one bounded conversation: the model is called, any tool calls it
//! requested are executed in order against a single toolbox, their results are
//! appended, and the model is called again until it states a verdict or a cap
//! is hit. Cancellation and the wall-clock limit are observed while waiting for
//! the model and while waiting for each tool.

use paynav_core::{ChatMessage, Config, Error, LLMResponse, Result, StreamDelta};
use paynav_providers::Provider;
use paynav_tools::{PageLauncher, ToolOutput, Toolbox};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{AgentEvent, EventSink, StatusEvent, StatusLevel};
use crate::verdict::{parse_verdict, Verdict};

/// What one run should try to reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationRequest {
    /// e.g. "reach the guest-payment page without logging in"
    pub goal: String,
    pub start_url: String,
    /// Label of the control that most likely leads to the goal.
    pub target: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NavigationReport {
    pub verdict: Verdict,
    pub trace: Vec<StatusEvent>,
    pub iterations: u32,
    pub tool_calls: u32,
    /// The full conversation of this run. Not kept anywhere else.
    pub conversation: Vec<ChatMessage>,
}

pub struct AgentHandle {
    pub events: mpsc::Receiver<AgentEvent>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<NavigationReport>,
}

const EVENT_BUFFER: usize = 256;

/// Run the agent on its own task.
pub fn spawn_navigation_agent(
    config: Config,
    provider: Arc<dyn Provider>,
    launcher: Arc<dyn PageLauncher>,
    request: NavigationRequest,
) -> AgentHandle {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        run_navigation_agent(&config, provider, launcher, request, tx, token).await
    });
    AgentHandle {
        events: rx,
        cancel,
        join,
    }
}

fn system_prompt(request: &NavigationRequest) -> String {
    let synonyms = if request.synonyms.is_empty() {
        "(none)".to_string()
    } else {
        request.synonyms.join(", ")
    };
    format!(
        "You drive a headless browser on a utility provider's website.\n\
         Goal: {goal}\n\n\
         Rules:\n\
         - Never log in, create an account, fill in or submit any form, or enter payment details.\n\
         - Only navigate by opening URLs and clicking links or buttons.\n\
         - Start with open_url on the start URL, then use snapshot_dom to see what is clickable.\n\
         - After every click_target, call wait_for_navigation and check the classification.\n\
         - The control most likely to help is labelled \"{target}\"; alternative wordings: {synonyms}.\n\
         - If a click reports \"no match\", pick different wording from the latest snapshot.\n\n\
         When you are done, reply without tool calls and end with exactly one JSON object:\n\
         {{\"reached\": true or false, \"reason\": \"one sentence\"}}",
        goal = request.goal,
        target = request.target,
        synonyms = synonyms,
    )
}

fn user_prompt(request: &NavigationRequest) -> String {
    format!(
        "Start URL: {}\nTarget: {}\nSynonyms: {}",
        request.start_url,
        request.target,
        serde_json::to_string(&request.synonyms).unwrap_or_else(|_| "[]".to_string())
    )
}

const NUDGE: &str = "You replied without a tool call or a verdict. Either call a tool, or finish with \
{\"reached\": true|false, \"reason\": \"...\"}.";

const RUN_TIME_LIMIT: &str = "run time limit reached";

/// Await `fut` unless the run is cancelled (`Error::Cancelled`) or out of
/// time (`Error::Timeout`) first.
async fn guarded<F: Future>(fut: F, cancel: &CancellationToken, deadline: Instant) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Error::Timeout(RUN_TIME_LIMIT.to_string())),
        out = fut => Ok(out),
    }
}

fn interrupt_reason(e: &Error) -> String {
    match e {
        Error::Timeout(what) => what.clone(),
        other => other.to_string(),
    }
}

/// Result recorded for a tool call the run did not let finish.
fn interrupted_output(e: &Error) -> ToolOutput {
    match e {
        Error::Cancelled => ToolOutput::cancelled(),
        other => ToolOutput::failure(&interrupt_reason(other)),
    }
}

/// How a run ended, before the live page is consulted.
enum Ending {
    Claimed { reached: bool, reason: String },
    Failed(String),
}

struct Run<'a> {
    config: &'a Config,
    provider: Arc<dyn Provider>,
    toolbox: Toolbox,
    sink: EventSink,
    cancel: CancellationToken,
    deadline: Instant,
    messages: Vec<ChatMessage>,
    iterations: u32,
    tool_calls: u32,
    malformed: u32,
    /// Last page URL a successful tool reported.
    last_url: Option<String>,
}

impl Run<'_> {
    /// One model call; text deltas are forwarded while it streams.
    async fn stream_once(&self, tools: &[Value]) -> Result<LLMResponse> {
        let (dtx, mut drx) = mpsc::channel::<StreamDelta>(64);
        let call = self.provider.chat_stream(&self.messages, tools, dtx);
        let forward = async {
            while let Some(delta) = drx.recv().await {
                match delta {
                    StreamDelta::Text(text) => self.sink.emit(AgentEvent::TextDelta { text }).await,
                    StreamDelta::ToolCallStarted { name, .. } => debug!(tool = %name, "Model started a tool call"),
                }
            }
        };
        let (result, ()) = tokio::join!(call, forward);
        result
    }

    /// Call the model, retrying transient failures with exponential backoff.
    async fn call_model(&mut self, tools: &[Value]) -> std::result::Result<LLMResponse, Ending> {
        let max_retries = self.config.agent.llm_max_retries;
        let base_delay_ms = self.config.agent.llm_retry_delay_ms;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay_ms = base_delay_ms * (1u64 << (attempt - 1).min(4));
                warn!(attempt, max_retries, delay_ms, iteration = self.iterations, "Retrying LLM call after transient error");
                self.sink
                    .status(StatusLevel::Warning, format!("Model call failed, retrying ({}/{})", attempt, max_retries))
                    .await;
                let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
                if let Err(e) = guarded(sleep, &self.cancel, self.deadline).await {
                    return Err(Ending::Failed(interrupt_reason(&e)));
                }
            }
            match guarded(self.stream_once(tools), &self.cancel, self.deadline).await {
                Err(e) => return Err(Ending::Failed(interrupt_reason(&e))),
                Ok(Ok(response)) => {
                    if attempt > 0 {
                        info!(attempt, iteration = self.iterations, "LLM call succeeded after retry");
                    }
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    warn!(error = %e, attempt, max_retries, iteration = self.iterations, "LLM call failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = match last_error {
            Some(e) => format!("model unavailable after {} retries: {}", max_retries, e),
            None => "model unavailable".to_string(),
        };
        Err(Ending::Failed(reason))
    }

    fn push_tool_result(&mut self, id: &str, name: &str, output: &ToolOutput) {
        let mut msg = ChatMessage::tool_result(id, &output.text);
        msg.name = Some(name.to_string());
        self.messages.push(msg);
    }

    /// Execute the turn's tool calls in order. Every call gets a result, even
    /// when the run is interrupted part-way.
    async fn execute_tools(&mut self, response: &LLMResponse) -> Option<Ending> {
        let mut assistant = ChatMessage::assistant(response.content.as_deref().unwrap_or(""));
        assistant.tool_calls = Some(response.tool_calls.clone());
        self.messages.push(assistant);

        let mut interrupted: Option<Error> = None;
        for call in &response.tool_calls {
            if let Some(e) = &interrupted {
                let output = interrupted_output(e);
                self.push_tool_result(&call.id, &call.name, &output);
                continue;
            }

            self.tool_calls += 1;
            info!(tool = %call.name, id = %call.id, iteration = self.iterations, "Executing tool call");
            self.sink
                .emit(AgentEvent::ToolStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .await;

            let dispatched = guarded(
                self.toolbox.dispatch(&call.name, &call.arguments),
                &self.cancel,
                self.deadline,
            )
            .await;
            let output = match dispatched {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %call.name, reason = %e, "Tool call interrupted");
                    let output = interrupted_output(&e);
                    interrupted = Some(e);
                    output
                }
            };

            if output.invalid_call {
                self.malformed += 1;
            }
            if let Some(url) = reported_url(&output) {
                self.last_url = Some(url);
            }
            let level = if output.ok { StatusLevel::Info } else { StatusLevel::Warning };
            self.sink.status(level, describe_tool_result(&call.name, &output)).await;
            self.sink
                .emit(AgentEvent::ToolFinished {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    ok: output.ok,
                    result: output.text.clone(),
                })
                .await;
            self.push_tool_result(&call.id, &call.name, &output);
        }

        if let Some(e) = interrupted {
            return Some(Ending::Failed(interrupt_reason(&e)));
        }
        if self.malformed > self.config.agent.max_malformed_calls {
            return Some(Ending::Failed(format!(
                "too many malformed tool calls ({})",
                self.malformed
            )));
        }
        None
    }

    async fn drive(&mut self) -> Ending {
        let tools = Toolbox::schemas();
        let max_iterations = self.config.agent.max_iterations;
        let mut nudged = false;

        while self.iterations < max_iterations {
            self.iterations += 1;
            debug!(iteration = self.iterations, "LLM call iteration");

            let response = match self.call_model(&tools).await {
                Ok(r) => r,
                Err(ending) => return ending,
            };
            info!(
                content_len = response.content.as_ref().map_or(0, |c| c.len()),
                tool_calls_count = response.tool_calls.len(),
                finish_reason = %response.finish_reason,
                "LLM response received"
            );

            if !response.tool_calls.is_empty() {
                if let Some(ending) = self.execute_tools(&response).await {
                    return ending;
                }
                continue;
            }

            let content = response.content.unwrap_or_default();
            self.messages.push(ChatMessage::assistant(&content));
            if let Some(claim) = parse_verdict(&content) {
                return Ending::Claimed {
                    reached: claim.reached,
                    reason: claim.reason,
                };
            }
            if nudged {
                return Ending::Failed("model stopped without a verdict".to_string());
            }
            nudged = true;
            self.sink
                .status(StatusLevel::Warning, "Model answered without a verdict; asking again")
                .await;
            self.messages.push(ChatMessage::user(NUDGE));
        }

        warn!(max_iterations, "Reached max iterations");
        Ending::Failed(format!("iteration cap of {} reached", max_iterations))
    }
}

fn reported_url(output: &ToolOutput) -> Option<String> {
    if !output.ok {
        return None;
    }
    let value: Value = serde_json::from_str(&output.text).ok()?;
    value
        .get("finalUrl")
        .or_else(|| value.get("url"))
        .and_then(|v| v.as_str())
        .filter(|url| !url.is_empty())
        .map(String::from)
}

fn describe_tool_result(name: &str, output: &ToolOutput) -> String {
    let value: Value = serde_json::from_str(&output.text).unwrap_or(Value::Null);
    if !output.ok {
        let error = value.get("error").and_then(|v| v.as_str()).unwrap_or("failed");
        return format!("{}: {}", name, error);
    }
    match name {
        "open_url" | "get_current_url" => {
            let url = value
                .get("finalUrl")
                .or_else(|| value.get("url"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            format!("{}: {}", name, url)
        }
        "click_target" => format!(
            "Clicked \"{}\"",
            value.get("clickedText").and_then(|v| v.as_str()).unwrap_or_default()
        ),
        "wait_for_navigation" => format!(
            "Navigation settled: {}",
            value.get("classification").and_then(|v| v.as_str()).unwrap_or("none")
        ),
        "snapshot_dom" => format!(
            "Snapshot: {} elements",
            value.get("count").and_then(|v| v.as_u64()).unwrap_or(0)
        ),
        _ => format!("{}: ok", name),
    }
}

/// Drive the model toward `request.goal` and return the verdict and trace.
/// The browser session is always released before this returns.
pub async fn run_navigation_agent(
    config: &Config,
    provider: Arc<dyn Provider>,
    launcher: Arc<dyn PageLauncher>,
    request: NavigationRequest,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> NavigationReport {
    let deadline = Instant::now() + Duration::from_secs(config.agent.run_timeout_secs);
    let mut run = Run {
        config,
        provider,
        toolbox: Toolbox::new(launcher, config),
        sink: EventSink::new(events),
        cancel,
        deadline,
        messages: vec![
            ChatMessage::system(&system_prompt(&request)),
            ChatMessage::user(&user_prompt(&request)),
        ],
        iterations: 0,
        tool_calls: 0,
        malformed: 0,
        last_url: None,
    };

    info!(goal = %request.goal, start_url = %request.start_url, target = %request.target, "Starting navigation run");
    run.sink
        .status(StatusLevel::Info, format!("Navigating from {} toward: {}", request.start_url, request.goal))
        .await;

    let ending = run.drive().await;

    // Teardown is bounded even when the page stops responding.
    let teardown = Duration::from_millis(config.agent.teardown_timeout_ms);
    let location = match tokio::time::timeout(teardown, run.toolbox.current_location()).await {
        Ok(location) => location,
        Err(_) => {
            warn!(timeout_ms = config.agent.teardown_timeout_ms, "Page did not report its location in time");
            None
        }
    };
    let (url, title) = location.unwrap_or_else(|| {
        let url = run.last_url.clone().unwrap_or_else(|| request.start_url.clone());
        (url, None)
    });
    if tokio::time::timeout(teardown, run.toolbox.cleanup()).await.is_err() {
        warn!(
            timeout_ms = config.agent.teardown_timeout_ms,
            "Browser teardown timed out; dropping the session kills the process"
        );
    }

    let verdict = match ending {
        Ending::Claimed { reached, reason } => Verdict {
            reached,
            url,
            title,
            reason,
        },
        Ending::Failed(reason) => Verdict {
            reached: false,
            url,
            title,
            reason,
        },
    };

    let (level, message) = if verdict.reached {
        (StatusLevel::Success, format!("Reached goal at {}", verdict.url))
    } else {
        (StatusLevel::Error, format!("Goal not reached: {}", verdict.reason))
    };
    info!(reached = verdict.reached, url = %verdict.url, reason = %verdict.reason, iterations = run.iterations, "Navigation run finished");
    run.sink.status(level, message).await;
    run.sink.emit(AgentEvent::Finished(verdict.clone())).await;

    NavigationReport {
        verdict,
        iterations: run.iterations,
        tool_calls: run.tool_calls,
        conversation: run.messages,
        trace: run.sink.into_trace(),
    }
}
