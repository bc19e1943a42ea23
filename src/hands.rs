//! Browser-facing seams and the session that owns the live browser.
//!
//! The navigator only ever talks to [`PageHandle`]; where the page comes from
//! is the [`BrowserProvider`]'s business. [`NavigationSession`] memoizes the
//! connection and drops it again when the provider reports a disconnect, so
//! the next caller reconnects instead of reusing a dead handle.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::BrowserError;

/// A single open page the agent can drive.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Evaluate a script in page context and return its value.
    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError>;

    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Wait until the document the last click started loading is ready.
    async fn wait_for_navigation(&self) -> Result<(), BrowserError>;

    /// Capture the viewport as a base64-encoded PNG.
    async fn screenshot(&self) -> Result<String, BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Close the page. The browser stays up for the next task.
    async fn close(&self) -> Result<(), BrowserError>;
}

/// A connected browser able to open pages.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&self, url: &str) -> Result<Arc<dyn PageHandle>, BrowserError>;
}

/// Establishes browser connections.
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Never connected.
    Idle,
    Connected,
    /// Last connection was lost; the next request reconnects.
    Disconnected,
}

enum SessionState {
    Idle,
    Connected(Arc<dyn BrowserHandle>),
    Disconnected,
}

impl SessionState {
    fn status(&self) -> SessionStatus {
        match self {
            Self::Idle => SessionStatus::Idle,
            Self::Connected(_) => SessionStatus::Connected,
            Self::Disconnected => SessionStatus::Disconnected,
        }
    }
}

/// Lazily-connected, shareable browser session.
pub struct NavigationSession {
    provider: Box<dyn BrowserProvider>,
    state: Mutex<SessionState>,
}

impl NavigationSession {
    pub fn new(provider: impl BrowserProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status()
    }

    async fn browser(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        let mut state = self.state.lock().await;
        if let SessionState::Connected(browser) = &*state {
            return Ok(browser.clone());
        }
        if state.status() == SessionStatus::Disconnected {
            info!(target: "hands", "reconnecting to browser");
        } else {
            info!(target: "hands", "connecting to browser");
        }
        let browser = self.provider.connect().await?;
        *state = SessionState::Connected(browser.clone());
        Ok(browser)
    }

    /// Open a new page at `url`, connecting first if needed.
    pub async fn new_page(&self, url: &str) -> Result<Arc<dyn PageHandle>, BrowserError> {
        let browser = self.browser().await?;
        let page = browser.new_page(url).await;
        self.observe(page).await
    }

    /// Pass a page-operation result through, invalidating the session if it
    /// reports a lost connection.
    pub async fn observe<T>(&self, result: Result<T, BrowserError>) -> Result<T, BrowserError> {
        if let Err(ref err) = result {
            if err.is_disconnect() {
                warn!(target: "hands", error = %err, "browser disconnected");
                self.invalidate().await;
            }
        }
        result
    }

    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, SessionState::Connected(_)) {
            *state = SessionState::Disconnected;
        }
    }
}
