//! CDP-driven browser automation.
//!
//! - `session`: one Chrome process and one page per session, launched lazily
//! - `snapshot`: visible interactive elements in reading order
//! - `resolver`: scores snapshot elements against a target phrase and clicks
//! - `navigation`: decides when a transition has settled and what kind it was
//!
//! Everything above `cdp` talks to a [`page::Page`], never to CDP directly.

pub mod cdp;
pub mod navigation;
pub mod page;
pub mod resolver;
pub mod session;
pub mod snapshot;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use navigation::{Baseline, Classification, NavigationOutcome};
pub use page::{LoadSignal, Page, PageLauncher};
pub use resolver::{ClickOutcome, MatchReason, ScoredCandidate};
pub use session::{BrowserSession, ChromeLauncher, OpenOutcome};
pub use snapshot::{ElementRecord, TagKind};
