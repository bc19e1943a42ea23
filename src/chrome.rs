//! Headless Chrome behind the browser seams.
//!
//! `headless_chrome` is a blocking library, so every call runs on the blocking
//! pool. Its errors arrive as `anyhow::Error` and are sorted into
//! [`BrowserError`] kinds by message.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::errors::BrowserError;
use crate::hands::{BrowserHandle, BrowserProvider, PageHandle};
use crate::types::{ID_ATTRIBUTE, NAVIGATION_TIMEOUT_MS};

const SETTLE_POLL: Duration = Duration::from_millis(100);

/// Launches Chrome, or attaches to one already running with remote
/// debugging enabled.
#[derive(Debug, Clone)]
pub struct ChromeProvider {
    /// Run without a window. On by default; the CLI's `--headed` turns it off.
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// DevTools websocket URL of a running browser.
    pub attach: Option<String>,
    pub navigation_timeout: Duration,
}

impl Default for ChromeProvider {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            attach: None,
            navigation_timeout: Duration::from_millis(NAVIGATION_TIMEOUT_MS),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BrowserError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BrowserError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrowserError::Evaluation(format!("browser task panicked: {e}")))?
}

/// Sort a `headless_chrome` failure into a [`BrowserError`].
pub(crate) fn classify(err: anyhow::Error) -> BrowserError {
    let message = format!("{err:#}");
    let lower = message.to_lowercase();
    if ["connection is closed", "channel closed", "disconnected", "broken pipe"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        BrowserError::Disconnected(message)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        BrowserError::Timeout(message)
    } else if lower.contains("find element") || lower.contains("no element") {
        BrowserError::ElementNotFound(message)
    } else {
        BrowserError::Evaluation(message)
    }
}

#[async_trait]
impl BrowserProvider for ChromeProvider {
    async fn connect(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        let provider = self.clone();
        let browser = blocking(move || match &provider.attach {
            Some(url) => {
                info!(target: "hands", url = %url, "attaching to running Chrome");
                Browser::connect(url.clone()).map_err(|e| BrowserError::Launch(format!("{e:#}")))
            }
            None => {
                info!(target: "hands", headless = provider.headless, "launching Chrome");
                let options = LaunchOptions {
                    headless: provider.headless,
                    path: provider.chrome_path.clone(),
                    idle_browser_timeout: Duration::from_secs(300),
                    ..Default::default()
                };
                Browser::new(options).map_err(|e| BrowserError::Launch(format!("{e:#}")))
            }
        })
        .await?;

        Ok(Arc::new(ChromeBrowser {
            browser: Arc::new(browser),
            navigation_timeout: self.navigation_timeout,
        }))
    }
}

struct ChromeBrowser {
    browser: Arc<Browser>,
    navigation_timeout: Duration,
}

#[async_trait]
impl BrowserHandle for ChromeBrowser {
    async fn new_page(&self, url: &str) -> Result<Arc<dyn PageHandle>, BrowserError> {
        let browser = self.browser.clone();
        let timeout = self.navigation_timeout;
        let target = url.to_string();
        let tab = blocking(move || {
            let tab = browser.new_tab().map_err(classify)?;
            tab.set_default_timeout(timeout);
            tab.navigate_to(&target).map_err(classify)?;
            tab.wait_until_navigated().map_err(classify)?;
            Ok(tab)
        })
        .await?;
        debug!(target: "hands", url, "opened page");

        Ok(Arc::new(ChromePage {
            tab,
            navigation_timeout: self.navigation_timeout,
        }))
    }
}

struct ChromePage {
    tab: Arc<Tab>,
    navigation_timeout: Duration,
}

impl ChromePage {
    fn tab(&self) -> Arc<Tab> {
        self.tab.clone()
    }

    /// True once the document is loaded and carries no stamps from the
    /// page the click started on.
    async fn settled(&self) -> Result<bool, BrowserError> {
        let script = format!(
            "document.readyState === 'complete' && !document.querySelector('[{ID_ATTRIBUTE}]')"
        );
        Ok(self.evaluate(&script).await? == Value::Bool(true))
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError> {
        let tab = self.tab();
        let script = script.to_string();
        blocking(move || {
            let result = tab.evaluate(&script, false).map_err(classify)?;
            Ok(result.value.unwrap_or(Value::Null))
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let tab = self.tab();
        let selector = selector.to_string();
        blocking(move || {
            let element = tab.find_element(&selector).map_err(|e| match classify(e) {
                err @ BrowserError::Disconnected(_) => err,
                _ => BrowserError::ElementNotFound(selector.clone()),
            })?;
            element.click().map_err(classify)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_navigation(&self) -> Result<(), BrowserError> {
        let started = Instant::now();
        loop {
            match self.settled().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                // The old context goes away mid-navigation.
                Err(BrowserError::Evaluation(_)) => {}
                Err(err) => return Err(err),
            }
            if started.elapsed() >= self.navigation_timeout {
                return Err(BrowserError::Timeout(format!(
                    "no new document after {:?}",
                    self.navigation_timeout
                )));
            }
            sleep(SETTLE_POLL).await;
        }
    }

    async fn screenshot(&self) -> Result<String, BrowserError> {
        let tab = self.tab();
        let png = blocking(move || {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(classify)
        })
        .await?;
        Ok(STANDARD.encode(png))
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let tab = self.tab();
        blocking(move || Ok(tab.get_url())).await
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let tab = self.tab();
        blocking(move || {
            tab.close(false).map_err(classify)?;
            Ok(())
        })
        .await
    }
}
