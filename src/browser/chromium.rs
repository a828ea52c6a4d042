use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::browser::{BrowserPage, BrowserSession};
use crate::runtime::session::{LaunchedSession, SessionBackend, SessionError};
use crate::runtime::VendorError;

/// Launch flags tuned for driving consumer web apps that dislike obvious
/// automation.
const LAUNCH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-background-networking",
    "--window-size=1440,900",
];

#[derive(Debug, Clone, Default)]
pub struct ChromiumSettings {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    /// Persistent profile directory; vendor logins live here.
    pub user_data_dir: Option<PathBuf>,
}

/// Launches one Chromium process per session and watches its CDP event
/// stream; when the stream ends the session's alive flag flips and the
/// session layer knows to replace it.
pub struct ChromiumBackend {
    settings: ChromiumSettings,
}

impl ChromiumBackend {
    pub fn new(settings: ChromiumSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionBackend for ChromiumBackend {
    async fn launch(&self) -> Result<LaunchedSession, SessionError> {
        let mut builder = BrowserConfig::builder().no_sandbox().args(LAUNCH_ARGS.to_vec());
        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &self.settings.executable {
            builder = builder.chrome_executable(executable);
        }
        if let Some(dir) = &self.settings.user_data_dir {
            builder = builder.user_data_dir(dir);
        }
        let config = builder.build().map_err(SessionError::Unavailable)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| SessionError::Unavailable(err.to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let watched = Arc::clone(&alive);
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser event error");
                }
            }
            // Stream end means the browser process is gone.
            watched.store(false, Ordering::SeqCst);
            warn!("browser disconnected");
        });

        Ok(LaunchedSession {
            connection: Arc::new(ChromiumSession { browser }),
            alive,
        })
    }
}

struct ChromiumSession {
    browser: Browser,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn open_page(&self, url: &str) -> Result<Box<dyn BrowserPage>, VendorError> {
        let page = self.browser.new_page(url).await.map_err(map_cdp)?;
        Ok(Box::new(ChromiumPage { page }))
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<(), VendorError> {
        self.page.goto(url).await.map_err(map_cdp)?;
        self.page.wait_for_navigation().await.map_err(map_cdp)?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), VendorError> {
        let element = self.page.find_element(selector).await.map_err(map_cdp)?;
        element.click().await.map_err(map_cdp)?;
        element.type_str(text).await.map_err(map_cdp)?;
        Ok(())
    }

    async fn press_key(&self, selector: &str, key: &str) -> Result<(), VendorError> {
        let element = self.page.find_element(selector).await.map_err(map_cdp)?;
        element.press_key(key).await.map_err(map_cdp)?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, VendorError> {
        let result = self.page.evaluate(expression).await.map_err(map_cdp)?;
        result
            .into_value()
            .map_err(|err| VendorError::Protocol(format!("evaluation result not JSON: {err}")))
    }

    async fn evaluate_on_new_document(&self, script: &str) -> Result<(), VendorError> {
        let params = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(script)
            .build()
            .map_err(VendorError::Protocol)?;
        self.page.execute(params).await.map_err(map_cdp)?;
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), VendorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VendorError::Protocol(format!(
                    "selector {selector:?} did not appear within {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn close(&self) -> Result<(), VendorError> {
        self.page.clone().close().await.map_err(map_cdp)?;
        Ok(())
    }
}

fn map_cdp(err: chromiumoxide::error::CdpError) -> VendorError {
    match err {
        chromiumoxide::error::CdpError::Ws(ws) => VendorError::SessionLost(ws.to_string()),
        chromiumoxide::error::CdpError::ChannelSendError(send) => {
            VendorError::SessionLost(send.to_string())
        }
        other => VendorError::Protocol(other.to_string()),
    }
}
