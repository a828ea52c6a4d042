pub mod chromium;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::runtime::VendorError;

/// An open browser with which pages can be created. One session maps to
/// one browser process; the session layer decides when to replace it.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn open_page(&self, url: &str) -> Result<Box<dyn BrowserPage>, VendorError>;
}

/// The small page surface the vendor flows actually use. Kept deliberately
/// narrow so tests can fake it without a browser.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), VendorError>;

    /// Click the element and type into it.
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), VendorError>;

    async fn press_key(&self, selector: &str, key: &str) -> Result<(), VendorError>;

    /// Run a script in the page and return its JSON result. Vendor flows
    /// lean on this for in-page `fetch` calls that ride the page's own
    /// cookies and headers.
    async fn evaluate(&self, expression: &str) -> Result<Value, VendorError>;

    /// Install a script that runs before any document in this page loads.
    async fn evaluate_on_new_document(&self, script: &str) -> Result<(), VendorError>;

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), VendorError>;

    async fn close(&self) -> Result<(), VendorError>;
}
