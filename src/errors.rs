use std::time::Duration;

use serde::{Serialize, Serializer};

/// Failures surfaced by a browser session provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrowserError {
    #[error("browser connection lost: {0}")]
    Disconnected(String),

    #[error("no element matches {0}")]
    ElementNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("browser launch failed: {0}")]
    Launch(String),
}

impl BrowserError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

/// Failures talking to the chat-thread service.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors that end a navigation task.
#[derive(Debug, thiserror::Error)]
pub enum NavigationError {
    #[error("could not open entry page: {0}")]
    Session(#[source] BrowserError),

    #[error("page could not be queried: {0}")]
    Extraction(#[source] BrowserError),

    #[error("element {identifier} is not on the page anymore")]
    StaleIdentifier { identifier: String },

    #[error("run {run_id} ended with status {status}: {message}")]
    RemoteService {
        run_id: String,
        status: String,
        message: String,
    },

    #[error("thread service request failed: {0}")]
    Thread(#[from] ThreadError),

    #[error("run {run_id} did not settle within {elapsed:?}")]
    RunTimedOut { run_id: String, elapsed: Duration },

    #[error("clicking {identifier} did not navigate: {source}")]
    NavigationTimeout {
        identifier: String,
        #[source]
        source: BrowserError,
    },

    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
}

impl NavigationError {
    /// Short stable name for logs and exported traces.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Extraction(_) => "extraction",
            Self::StaleIdentifier { .. } => "stale_identifier",
            Self::RemoteService { .. } | Self::Thread(_) | Self::RunTimedOut { .. } => {
                "remote_service"
            }
            Self::NavigationTimeout { .. } => "navigation_timeout",
            Self::Browser(_) => "browser",
        }
    }
}

impl Serialize for NavigationError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("NavigationError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

/// Missing or malformed configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set in environment")]
    MissingVar(&'static str),
}
