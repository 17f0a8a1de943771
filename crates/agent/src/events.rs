//! Progress events surfaced to whoever drives a navigation run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::verdict::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One line of the run trace shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub level: StatusLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Status(StatusEvent),
    TextDelta {
        text: String,
    },
    ToolStarted {
        id: String,
        name: String,
        arguments: String,
    },
    ToolFinished {
        id: String,
        name: String,
        ok: bool,
        result: String,
    },
    Finished(Verdict),
}

/// Sends events and keeps the status trace for the final report.
pub(crate) struct EventSink {
    tx: mpsc::Sender<AgentEvent>,
    trace: Vec<StatusEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx, trace: Vec::new() }
    }

    pub async fn emit(&self, event: AgentEvent) {
        // Nobody listening is fine; the trace is still returned.
        let _ = self.tx.send(event).await;
    }

    pub async fn status(&mut self, level: StatusLevel, message: impl Into<String>) {
        let event = StatusEvent {
            level,
            message: message.into(),
            at: Utc::now(),
        };
        self.trace.push(event.clone());
        self.emit(AgentEvent::Status(event)).await;
    }

    pub fn into_trace(self) -> Vec<StatusEvent> {
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_records_trace_without_listener() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut sink = EventSink::new(tx);
        sink.status(StatusLevel::Info, "opening site").await;
        sink.status(StatusLevel::Warning, "no match").await;
        let trace = sink.into_trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[1].level, StatusLevel::Warning);
    }

    #[test]
    fn test_event_serialization() {
        let event = AgentEvent::ToolFinished {
            id: "call_1".to_string(),
            name: "click_target".to_string(),
            ok: false,
            result: r#"{"ok":false}"#.to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_finished");
        assert_eq!(value["ok"], false);

        let status = AgentEvent::Status(StatusEvent {
            level: StatusLevel::Success,
            message: "done".to_string(),
            at: Utc::now(),
        });
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["level"], "success");
    }
}
