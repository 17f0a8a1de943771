pub mod browser;
pub mod invocation;
pub mod toolbox;

pub use browser::{BrowserSession, ChromeLauncher, Page, PageLauncher};
pub use invocation::{InvocationError, ToolInvocation, ToolName};
pub use toolbox::{ToolOutput, Toolbox};
