//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! Communicates with a page target via its debugging WebSocket endpoint.
//! Supports sending commands, receiving responses, and subscribing to events.

use paynav_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

/// A CDP WebSocket client that can send commands and receive responses/events.
pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by request ID.
    pending: PendingMap,
    /// Auto-incrementing command ID.
    next_id: AtomicU64,
    /// Event listeners (domain.event -> channels).
    event_listeners: ListenerMap,
    command_timeout: Duration,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str, command_timeout: Duration) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Session(format!("failed to connect to CDP endpoint {}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let event_listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let events_clone = event_listeners.clone();

        // Writer task: owns the sink, forwards messages from channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        // Reader task: dispatches responses by id and events by method
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = pending_clone.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let mut listeners = events_clone.lock().await;
                            if let Some(senders) = listeners.get_mut(method) {
                                let params = val.get("params").cloned().unwrap_or(Value::Null);
                                senders.retain(|tx| !tx.is_closed());
                                for tx in senders.iter() {
                                    let _ = tx.try_send(params.clone());
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Fail every in-flight command so callers see a closed session.
            pending_clone.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            command_timeout,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Send a CDP command and wait for the response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Session(format!("CDP connection closed while sending '{}'", method)));
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(Error::Browser(format!("CDP error in '{}': {}", method, error)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(Error::Session(format!("CDP connection closed awaiting '{}'", method))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!(
                    "CDP command '{}' timed out after {}s",
                    method,
                    self.command_timeout.as_secs()
                )))
            }
        }
    }

    /// Subscribe to a CDP event. Returns a receiver that will get event params.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        let mut listeners = self.event_listeners.lock().await;
        listeners.entry(method.to_string()).or_default().push(tx);
        rx
    }

    /// Enable a CDP domain (e.g., "Page", "Runtime", "Network").
    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    /// Start a navigation. Resolves once the browser has committed to the
    /// request, not when the page has loaded.
    pub async fn navigate(&self, url: &str) -> Result<Value> {
        let result = self.send_command("Page.navigate", json!({"url": url})).await?;
        if let Some(error_text) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(Error::Browser(format!("navigation to {} failed: {}", url, error_text)));
        }
        Ok(result)
    }

    /// Evaluate JavaScript in the page context and return its value.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .or_else(|| details.get("text").and_then(|t| t.as_str()))
                .unwrap_or("unknown exception");
            return Err(Error::Browser(format!("script threw: {}", text)));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Set viewport/device metrics.
    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.send_command(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.send_command(
            "Network.setUserAgentOverride",
            json!({"userAgent": user_agent, "acceptLanguage": "en-US,en"}),
        )
        .await?;
        Ok(())
    }

    /// Ask the browser to emit `Page.lifecycleEvent` (networkIdle and friends).
    pub async fn enable_lifecycle_events(&self) -> Result<()> {
        self.send_command("Page.setLifecycleEventsEnabled", json!({"enabled": true}))
            .await?;
        Ok(())
    }

    /// Close the page this client is attached to.
    pub async fn close_page(&self) -> Result<()> {
        self.send_command("Page.close", json!({})).await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// A one-connection DevTools endpoint. `reply` maps a method to the
    /// messages sent back; the last one is stamped with the command id.
    pub(crate) async fn fake_devtools(reply: fn(&str) -> Vec<Value>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let cmd: Value = serde_json::from_str(&text).unwrap();
                let mut messages = reply(cmd["method"].as_str().unwrap_or_default());
                if let Some(last) = messages.last_mut() {
                    last["id"] = cmd["id"].clone();
                }
                for msg in messages {
                    if ws.send(Message::Text(msg.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        });
        format!("ws://{}", addr)
    }

    fn devtools_reply(method: &str) -> Vec<Value> {
        match method {
            "Runtime.evaluate" => vec![json!({"result": {"result": {"type": "string", "value": "Pay Your Bill"}}})],
            "Page.navigate" => vec![
                json!({"method": "Page.domContentEventFired", "params": {"timestamp": 1.5}}),
                json!({"result": {"frameId": "F1", "loaderId": "L1"}}),
            ],
            "Page.close" => vec![json!({"error": {"code": -32000, "message": "Not attached"}})],
            _ => vec![json!({"result": {}})],
        }
    }

    #[tokio::test]
    async fn test_evaluate_returns_value() {
        let url = fake_devtools(devtools_reply).await;
        let cdp = CdpClient::connect(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cdp.evaluate_js("document.title").await.unwrap(), "Pay Your Bill");
        cdp.enable_domain("Page").await.unwrap();
    }

    #[tokio::test]
    async fn test_script_exception_is_browser_error() {
        let url = fake_devtools(|_| {
            vec![json!({"result": {
                "result": {"type": "object"},
                "exceptionDetails": {"text": "Uncaught", "exception": {"description": "ReferenceError: payBtn is not defined"}}
            }})]
        })
        .await;
        let cdp = CdpClient::connect(&url, Duration::from_secs(5)).await.unwrap();
        match cdp.evaluate_js("payBtn.click()").await {
            Err(Error::Browser(msg)) => assert!(msg.contains("payBtn is not defined")),
            other => panic!("expected browser error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_protocol_error_and_events() {
        let url = fake_devtools(devtools_reply).await;
        let cdp = CdpClient::connect(&url, Duration::from_secs(5)).await.unwrap();
        let mut loaded = cdp.subscribe_event("Page.domContentEventFired").await;

        cdp.navigate("https://util.example.com/").await.unwrap();
        let params = tokio::time::timeout(Duration::from_secs(2), loaded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params["timestamp"], 1.5);

        assert!(matches!(cdp.close_page().await, Err(Error::Browser(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_is_session_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = CdpClient::connect(&format!("ws://{}", addr), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Session(_))));
    }
}
