//! Navigation completion detection.
//!
//! No single browser event says "the page has settled" on every site, so
//! [`wait_for_navigation`] races four independent signals, stops at the first
//! one that fires and then re-reads the page to classify what happened.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use paynav_core::{NavigationConfig, Result};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::page::{current_title, current_url, LoadSignal, Page};

/// Text length of the main content region, or of the body when there is none.
pub const CONTENT_LENGTH_JS: &str = r#"(() => {
  const main = document.querySelector('main, [role=main], #main, #content, .main-content');
  const root = main || document.body;
  return root ? (root.innerText || '').length : 0;
})()"#;

/// Page state captured before an action that may navigate.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub url: String,
    pub title: String,
    pub content_len: u64,
}

pub async fn content_length(page: &dyn Page) -> Result<u64> {
    let value = page.evaluate(CONTENT_LENGTH_JS).await?;
    Ok(value.as_u64().or_else(|| value.as_f64().map(|f| f as u64)).unwrap_or(0))
}

pub async fn capture_baseline(page: &dyn Page) -> Result<Baseline> {
    Ok(Baseline {
        url: current_url(page).await?,
        title: current_title(page).await?,
        content_len: content_length(page).await?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    FullNavigation,
    UrlChange,
    TitleChange,
    SamePageUpdate,
    SpaNavigation,
    None,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullNavigation => "full-navigation",
            Self::UrlChange => "url-change",
            Self::TitleChange => "title-change",
            Self::SamePageUpdate => "same-page-update",
            Self::SpaNavigation => "spa-navigation",
            Self::None => "none",
        }
    }
}

/// Everything the classifier looks at.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub initial_url: String,
    pub final_url: String,
    pub initial_title: String,
    pub final_title: String,
    pub signal_fired: bool,
    pub content_grew: bool,
}

pub fn classify(t: &Transition) -> Classification {
    let url_changed = t.initial_url != t.final_url;
    let title_changed = t.initial_title != t.final_title;
    match (url_changed, title_changed) {
        (true, true) => Classification::FullNavigation,
        (true, false) => Classification::UrlChange,
        (false, true) => Classification::TitleChange,
        (false, false) if t.signal_fired => Classification::SamePageUpdate,
        (false, false) if t.content_grew => Classification::SpaNavigation,
        (false, false) => Classification::None,
    }
}

/// Whether the main content grew enough to count as an in-place transition.
pub fn content_grew(before: u64, after: u64, config: &NavigationConfig) -> bool {
    after >= before.saturating_add(config.spa_min_growth_chars)
        && (after as f64) >= (before as f64) * config.spa_growth_ratio
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    NetworkIdle,
    DomContentLoaded,
    UrlChanged,
    TitleChanged,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationOutcome {
    pub initial_url: String,
    pub final_url: String,
    pub initial_title: String,
    pub final_title: String,
    pub url_changed: bool,
    pub title_changed: bool,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    pub elapsed_ms: u64,
}

async fn poll_until_changed<'a, F>(read: F, initial: String, interval: Duration) -> Result<bool>
where
    F: Fn() -> BoxFuture<'a, Result<String>>,
{
    loop {
        match read().await {
            Ok(now) if now != initial => return Ok(true),
            Ok(_) => {}
            Err(e) if e.is_session_error() => return Err(e),
            // Mid-navigation the execution context may be gone; keep polling.
            Err(e) => debug!(error = %e, "Page read failed while polling"),
        }
        tokio::time::sleep(interval).await;
    }
}

async fn with_timeout(signal: Signal, timeout: Duration, fut: BoxFuture<'_, Result<bool>>) -> (Signal, Result<bool>) {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => (signal, result),
        Err(_) => (signal, Ok(false)),
    }
}

async fn read_with_retry<'a, F>(read: F, attempts: u32, interval: Duration) -> Result<String>
where
    F: Fn() -> BoxFuture<'a, Result<String>>,
{
    let mut last = read().await;
    for _ in 1..attempts {
        match &last {
            Ok(_) => break,
            Err(e) if e.is_session_error() => break,
            Err(_) => {
                tokio::time::sleep(interval).await;
                last = read().await;
            }
        }
    }
    last
}

/// Wait for the page to settle after an action and classify the transition.
///
/// `baseline` is the state recorded before the action; without one the
/// current state is used. `cap` shortens every per-signal timeout.
pub async fn wait_for_navigation(
    page: &dyn Page,
    baseline: Option<Baseline>,
    config: &NavigationConfig,
    cap: Option<Duration>,
) -> Result<NavigationOutcome> {
    let started = Instant::now();
    let baseline = match baseline {
        Some(b) => b,
        None => capture_baseline(page).await?,
    };
    let poll = Duration::from_millis(config.poll_interval_ms.max(1));
    let limit = |ms: u64| {
        let d = Duration::from_millis(ms);
        cap.map_or(d, |c| d.min(c))
    };

    let read_url = || current_url(page).boxed();
    let read_title = || current_title(page).boxed();

    let mut race: FuturesUnordered<BoxFuture<'_, (Signal, Result<bool>)>> = FuturesUnordered::new();
    race.push(
        with_timeout(
            Signal::NetworkIdle,
            limit(config.network_idle_timeout_ms),
            page.wait_for_signal(LoadSignal::NetworkIdle, limit(config.network_idle_timeout_ms)),
        )
        .boxed(),
    );
    race.push(
        with_timeout(
            Signal::DomContentLoaded,
            limit(config.dom_ready_timeout_ms),
            page.wait_for_signal(LoadSignal::DomContentLoaded, limit(config.dom_ready_timeout_ms)),
        )
        .boxed(),
    );
    race.push(
        with_timeout(
            Signal::UrlChanged,
            limit(config.url_change_timeout_ms),
            poll_until_changed(read_url, baseline.url.clone(), poll).boxed(),
        )
        .boxed(),
    );
    race.push(
        with_timeout(
            Signal::TitleChanged,
            limit(config.title_change_timeout_ms),
            poll_until_changed(read_title, baseline.title.clone(), poll).boxed(),
        )
        .boxed(),
    );

    let mut fired = None;
    while let Some((signal, result)) = race.next().await {
        match result {
            Ok(true) => {
                fired = Some(signal);
                break;
            }
            Ok(false) => debug!(signal = ?signal, "Navigation signal timed out"),
            Err(e) if e.is_session_error() => return Err(e),
            Err(e) => debug!(signal = ?signal, error = %e, "Navigation signal failed"),
        }
    }
    drop(race);

    let final_url = read_with_retry(read_url, 3, poll).await?;
    let final_title = read_with_retry(read_title, 3, poll).await?;
    let mut transition = Transition {
        initial_url: baseline.url.clone(),
        final_url,
        initial_title: baseline.title.clone(),
        final_title,
        signal_fired: fired.is_some(),
        content_grew: false,
    };

    let unchanged = transition.initial_url == transition.final_url && transition.initial_title == transition.final_title;
    if unchanged && fired.is_none() {
        let after = content_length(page).await.unwrap_or(baseline.content_len);
        transition.content_grew = content_grew(baseline.content_len, after, config);
    }

    let classification = classify(&transition);
    let outcome = NavigationOutcome {
        url_changed: transition.initial_url != transition.final_url,
        title_changed: transition.initial_title != transition.final_title,
        initial_url: transition.initial_url,
        final_url: transition.final_url,
        initial_title: transition.initial_title,
        final_title: transition.final_title,
        classification,
        signal: fired,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        classification = classification.as_str(),
        signal = ?fired,
        final_url = %outcome.final_url,
        "Navigation settled"
    );
    Ok(outcome)
}
