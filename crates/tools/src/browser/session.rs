//! Browser session management.
//!
//! A [`BrowserSession`] owns at most one Chrome process and one page. It is
//! created empty and launches the browser lazily on first use; every tool call
//! targets the same page until [`BrowserSession::cleanup`] releases it.

use async_trait::async_trait;
use paynav_core::{BrowserConfig, Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cdp::CdpClient;
use super::page::{current_title, current_url, LoadSignal, Page, PageLauncher};

/// Result of [`BrowserSession::open`]. Navigation failures are reported here
/// instead of being returned as errors.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOutcome {
    pub ok: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BrowserSession {
    launcher: Arc<dyn PageLauncher>,
    page: Option<Arc<dyn Page>>,
    navigation_timeout: Duration,
}

impl BrowserSession {
    pub fn new(launcher: Arc<dyn PageLauncher>, navigation_timeout: Duration) -> Self {
        Self {
            launcher,
            page: None,
            navigation_timeout,
        }
    }

    pub fn is_live(&self) -> bool {
        self.page.is_some()
    }

    /// The live page, launching the browser first if needed.
    pub async fn page(&mut self) -> Result<Arc<dyn Page>> {
        if let Some(page) = &self.page {
            return Ok(page.clone());
        }
        info!("Launching browser session");
        let page = self.launcher.launch().await?;
        self.page = Some(page.clone());
        Ok(page)
    }

    /// Navigate the session page to `url`.
    pub async fn open(&mut self, url: &str) -> Result<OpenOutcome> {
        let page = self.page().await?;
        match page.goto(url, self.navigation_timeout).await {
            Ok(()) => {
                let final_url = current_url(page.as_ref()).await.ok();
                let title = current_title(page.as_ref()).await.ok();
                info!(url = %url, final_url = ?final_url, "Opened page");
                Ok(OpenOutcome {
                    ok: true,
                    url: url.to_string(),
                    final_url,
                    title,
                    error: None,
                })
            }
            Err(e) if e.is_session_error() => Err(e),
            Err(e) => {
                warn!(url = %url, error = %e, "Navigation failed");
                Ok(OpenOutcome {
                    ok: false,
                    url: url.to_string(),
                    final_url: None,
                    title: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Forget a page that stopped responding; the next call relaunches.
    pub async fn invalidate(&mut self) {
        if self.page.is_some() {
            warn!("Dropping unusable browser session");
            self.cleanup().await;
        }
    }

    /// Release the page and then the browser. Errors are logged, never returned.
    pub async fn cleanup(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!(error = %e, "Error during browser teardown");
            }
            info!("Browser session closed");
        }
    }
}

/// `Page.navigate` omits `loaderId` when only the fragment changes; no new
/// document is loaded and `domContentEventFired` never follows.
fn is_same_document(navigate_result: &Value) -> bool {
    navigate_result
        .get("loaderId")
        .and_then(|v| v.as_str())
        .map_or(true, str::is_empty)
}

/// A Chrome page driven over CDP, owning the browser process that hosts it.
pub struct ChromePage {
    cdp: CdpClient,
    process: Mutex<Option<Child>>,
    user_data_dir: PathBuf,
    closed: AtomicBool,
}

#[async_trait]
impl Page for ChromePage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        let mut dom_ready = self.cdp.subscribe_event("Page.domContentEventFired").await;
        let navigated = self.cdp.navigate(url).await?;
        if is_same_document(&navigated) {
            debug!(url = %url, "Same-document navigation, no load to wait for");
            return Ok(());
        }
        match tokio::time::timeout(timeout, dom_ready.recv()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::Session("page event stream closed".to_string())),
            Err(_) => Err(Error::Timeout(format!(
                "navigation to {} did not finish within {}ms",
                url,
                timeout.as_millis()
            ))),
        }
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.cdp.evaluate_js(expression).await
    }

    async fn wait_for_signal(&self, signal: LoadSignal, timeout: Duration) -> Result<bool> {
        let wait = async {
            match signal {
                LoadSignal::DomContentLoaded => {
                    let mut rx = self.cdp.subscribe_event("Page.domContentEventFired").await;
                    rx.recv().await.is_some()
                }
                LoadSignal::NetworkIdle => {
                    let mut rx = self.cdp.subscribe_event("Page.lifecycleEvent").await;
                    while let Some(params) = rx.recv().await {
                        if params.get("name").and_then(|v| v.as_str()) == Some("networkIdle") {
                            return true;
                        }
                    }
                    false
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(true) => Ok(true),
            Ok(false) => Err(Error::Session("page event stream closed".to_string())),
            Err(_) => Ok(false),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.cdp.close_page().await {
            debug!(error = %e, "Page.close failed (page may already be gone)");
        }
        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill browser process");
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!(error = %e, dir = %self.user_data_dir.display(), "Failed to remove browser profile");
        }
        Ok(())
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        // Best-effort kill when the page is dropped without cleanup
        if let Ok(mut guard) = self.process.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

/// Launches a dedicated headless Chrome per session.
pub struct ChromeLauncher {
    config: BrowserConfig,
    profiles_dir: PathBuf,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig, profiles_dir: PathBuf) -> Self {
        Self { config, profiles_dir }
    }
}

#[async_trait]
impl PageLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Page>> {
        let browser_path = self
            .config
            .chrome_path
            .clone()
            .or_else(find_browser_binary)
            .ok_or_else(|| Error::Session("Chrome not found. Please install it or set browser.chromePath.".to_string()))?;

        let debug_port = find_free_port().await?;
        let user_data_dir = self.profiles_dir.join(format!("session-{}", debug_port));
        std::fs::create_dir_all(&user_data_dir)?;

        let args = build_browser_args(&self.config, debug_port, &user_data_dir);

        info!(
            port = debug_port,
            headless = self.config.headless,
            path = %browser_path,
            "Launching browser"
        );

        let child = Command::new(&browser_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Session(format!("failed to launch {}: {}", browser_path, e)))?;

        wait_for_cdp_ready(debug_port, self.config.launch_timeout_secs).await?;
        let page_ws_url = get_page_ws_url(debug_port).await?;

        let cdp = CdpClient::connect(&page_ws_url, Duration::from_secs(self.config.command_timeout_secs)).await?;
        cdp.enable_domain("Page").await?;
        cdp.enable_domain("Runtime").await?;
        cdp.enable_domain("Network").await?;
        cdp.enable_lifecycle_events().await?;
        cdp.set_viewport(self.config.viewport_width, self.config.viewport_height).await?;
        cdp.set_user_agent(&self.config.user_agent).await?;

        info!(ws_url = %page_ws_url, "CDP connection established (page target)");

        Ok(Arc::new(ChromePage {
            cdp,
            process: Mutex::new(Some(child)),
            user_data_dir,
            closed: AtomicBool::new(false),
        }))
    }
}

fn build_browser_args(config: &BrowserConfig, debug_port: u16, user_data_dir: &std::path::Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--password-store=basic".to_string(),
        format!("--window-size={},{}", config.viewport_width, config.viewport_height),
        format!("--user-agent={}", config.user_agent),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    args.push("about:blank".to_string());
    args
}

/// Find a Chrome or Chromium binary on the system.
pub fn find_browser_binary() -> Option<String> {
    let candidates: Vec<&str> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome", "google-chrome-stable",
            "chromium", "chromium-browser",
            "/usr/bin/google-chrome", "/usr/bin/chromium",
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    };

    for candidate in candidates {
        if std::path::Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll /json/version until Chrome's CDP endpoint answers.
async fn wait_for_cdp_ready(port: u16, timeout_secs: u64) -> Result<()> {
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(Error::Session(format!(
                "Chrome CDP not ready after {}s on port {}",
                timeout_secs, port
            )));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()).is_some() {
                    return Ok(());
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// WebSocket URL of the first page target listed by /json/list.
async fn get_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };

        let page_ws = targets
            .iter()
            .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
            .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()));
        if let Some(ws_url) = page_ws {
            return Ok(ws_url.to_string());
        }
    }

    Err(Error::Session("no page target found after retries".to_string()))
}
