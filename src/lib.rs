//! Drives a live web page towards a goal, one model-chosen action at a time.
//!
//! Each step the page is reduced to an outline of its interactive elements,
//! the model picks one function call on a fresh assistants thread, and the
//! call is carried out in the browser. See [`navigator::run_navigation_task`].

pub mod assistants;
pub mod brain;
pub mod chrome;
pub mod config;
pub mod dom;
pub mod errors;
pub mod hands;
pub mod navigator;
pub mod outline;
pub mod tools;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use assistants::AssistantClient;
pub use brain::{Orchestrator, OrchestratorConfig, RunOutcome, ThreadService};
pub use chrome::ChromeProvider;
pub use config::AssistantConfig;
pub use errors::{BrowserError, ConfigError, NavigationError, ThreadError};
pub use hands::{BrowserHandle, BrowserProvider, NavigationSession, PageHandle, SessionStatus};
pub use navigator::{Navigator, NavigatorConfig, run_navigation_task};
pub use types::{ElementDescriptor, LiveIdentifierSet, NavigationTask, Step, TaskOutcome};
