//! In-memory [`Page`] used by the browser and tool tests.

use async_trait::async_trait;
use paynav_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::navigation::CONTENT_LENGTH_JS;
use super::page::{LoadSignal, Page, PageLauncher};
use super::resolver::CLICK_JS;
use super::snapshot::{RawElement, SNAPSHOT_JS};

#[derive(Default, Clone)]
struct Location {
    url: String,
    title: String,
}

#[derive(Default)]
struct State {
    location: Location,
    content_len: u64,
    elements: Vec<RawElement>,
    routes: HashMap<String, Location>,
    click_effects: HashMap<String, Location>,
    pending_change: Option<(Instant, Location)>,
    signals: HashMap<&'static str, Duration>,
    goto_error: Option<Error>,
    broken: bool,
    stale_clicks: u32,
    clicks: Vec<String>,
    closes: usize,
}

pub struct FakePage {
    state: Mutex<State>,
}

impl FakePage {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            state: Mutex::new(State {
                location: Location {
                    url: url.to_string(),
                    title: title.to_string(),
                },
                ..State::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, _)) = &state.pending_change {
            if Instant::now() >= *at {
                if let Some((_, loc)) = state.pending_change.take() {
                    state.location = loc;
                }
            }
        }
        f(&mut state)
    }

    pub fn add_element(&self, text: &str, tag: &str, href: Option<&str>, y: f64) {
        self.with(|s| {
            s.elements.push(RawElement {
                text: text.to_string(),
                tag: tag.to_string(),
                href: href.map(String::from),
                x: 10.0,
                y,
                width: 120.0,
                height: 24.0,
                visible: true,
                ..RawElement::default()
            })
        });
    }

    pub fn on_goto(&self, url: &str, final_url: &str, title: &str) {
        self.with(|s| {
            s.routes.insert(
                url.to_string(),
                Location {
                    url: final_url.to_string(),
                    title: title.to_string(),
                },
            )
        });
    }

    pub fn on_click(&self, text: &str, url: &str, title: &str) {
        self.with(|s| {
            s.click_effects.insert(
                text.to_string(),
                Location {
                    url: url.to_string(),
                    title: title.to_string(),
                },
            )
        });
    }

    pub fn fail_next_goto(&self, error: Error) {
        self.with(|s| s.goto_error = Some(error));
    }

    /// Every later call fails as if the browser had gone away.
    pub fn break_session(&self) {
        self.with(|s| s.broken = true);
    }

    pub fn restore_session(&self) {
        self.with(|s| s.broken = false);
    }

    pub fn set_stale_clicks(&self, count: u32) {
        self.with(|s| s.stale_clicks = count);
    }

    pub fn set_location(&self, url: &str, title: &str) {
        self.with(|s| {
            s.location = Location {
                url: url.to_string(),
                title: title.to_string(),
            }
        });
    }

    pub fn change_location_after(&self, delay: Duration, url: &str, title: &str) {
        self.with(|s| {
            s.pending_change = Some((
                Instant::now() + delay,
                Location {
                    url: url.to_string(),
                    title: title.to_string(),
                },
            ))
        });
    }

    pub fn set_content_len(&self, len: u64) {
        self.with(|s| s.content_len = len);
    }

    pub fn fire_signal(&self, signal: LoadSignal, after: Duration) {
        self.with(|s| s.signals.insert(signal.name(), after));
    }

    pub fn clicks(&self) -> Vec<String> {
        self.with(|s| s.clicks.clone())
    }

    pub fn close_count(&self) -> usize {
        self.with(|s| s.closes)
    }

    fn check_live(&self) -> Result<()> {
        if self.with(|s| s.broken) {
            return Err(Error::Session("browser disconnected".to_string()));
        }
        Ok(())
    }

    fn click(&self, expression: &str) -> Result<Value> {
        let args = expression
            .strip_prefix(CLICK_JS)
            .and_then(|rest| rest.strip_prefix('('))
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| Error::Browser("malformed click script".to_string()))?;
        let args: Value = serde_json::from_str(args)?;
        let text = args["text"].as_str().unwrap_or_default().to_string();

        Ok(self.with(|s| {
            if s.stale_clicks > 0 {
                s.stale_clicks -= 1;
                return json!({"clicked": false, "stale": true});
            }
            if let Some(loc) = s.click_effects.get(&text).cloned() {
                s.location = loc;
            }
            s.clicks.push(text);
            json!({"clicked": true, "stale": false})
        }))
    }
}

#[async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.check_live()?;
        self.with(|s| {
            if let Some(err) = s.goto_error.take() {
                return Err(err);
            }
            s.location = s.routes.get(url).cloned().unwrap_or_else(|| Location {
                url: url.to_string(),
                title: String::new(),
            });
            Ok(())
        })
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.check_live()?;
        match expression {
            "window.location.href" => Ok(Value::String(self.with(|s| s.location.url.clone()))),
            "document.title" => Ok(Value::String(self.with(|s| s.location.title.clone()))),
            e if e == SNAPSHOT_JS => Ok(serde_json::to_value(self.with(|s| s.elements.clone()))?),
            e if e == CONTENT_LENGTH_JS => Ok(json!(self.with(|s| s.content_len))),
            e if e.starts_with(CLICK_JS) => self.click(e),
            other => Err(Error::Browser(format!("unsupported script: {}", other))),
        }
    }

    async fn wait_for_signal(&self, signal: LoadSignal, timeout: Duration) -> Result<bool> {
        self.check_live()?;
        match self.with(|s| s.signals.get(signal.name()).copied()) {
            Some(after) if after <= timeout => {
                tokio::time::sleep(after).await;
                Ok(true)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Ok(false)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.with(|s| s.closes += 1);
        Ok(())
    }
}

/// Hands out the same page on every launch.
pub struct FakeLauncher {
    page: Arc<FakePage>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(page: Arc<FakePage>) -> Self {
        Self {
            page,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Page>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(self.page.clone())
    }
}

/// Always fails to start a browser.
pub struct FailingLauncher;

#[async_trait]
impl PageLauncher for FailingLauncher {
    async fn launch(&self) -> Result<Arc<dyn Page>> {
        Err(Error::Session("Chrome not found".to_string()))
    }
}
