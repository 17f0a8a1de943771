//! The seam between browser-facing logic and the actual browser.
//!
//! Snapshot, resolver and navigation code only talk to a [`Page`], so they run
//! unchanged against Chrome over CDP or against an in-memory page in tests.

use async_trait::async_trait;
use paynav_core::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Load-progress signals a page can report on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSignal {
    NetworkIdle,
    DomContentLoaded,
}

impl LoadSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NetworkIdle => "network-idle",
            Self::DomContentLoaded => "dom-content-loaded",
        }
    }
}

#[async_trait]
pub trait Page: Send + Sync {
    /// Navigate and wait until the new document is committed.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Evaluate a JavaScript expression and return its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<Value>;

    /// Wait for a load signal fired after this call. `Ok(false)` on timeout.
    async fn wait_for_signal(&self, signal: LoadSignal, timeout: Duration) -> Result<bool>;

    /// Release the page, then the browser that hosts it. Safe to call twice.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PageLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Page>>;
}

/// Read `location.href`.
pub async fn current_url(page: &dyn Page) -> Result<String> {
    let value = page.evaluate("window.location.href").await?;
    Ok(value.as_str().unwrap_or_default().to_string())
}

/// Read `document.title`.
pub async fn current_title(page: &dyn Page) -> Result<String> {
    let value = page.evaluate("document.title").await?;
    Ok(value.as_str().unwrap_or_default().to_string())
}
