pub mod events;
pub mod runtime;
pub mod verdict;

pub use events::{AgentEvent, StatusEvent, StatusLevel};
pub use runtime::{
    run_navigation_agent, spawn_navigation_agent, AgentHandle, NavigationReport, NavigationRequest,
};
pub use verdict::{parse_verdict, Claim, Verdict};
