pub mod limiter;
pub mod orchestrator;
pub mod poll;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::browser::BrowserPage;
use crate::runtime::poll::PollSettings;
use crate::runtime::session::SessionHandle;

/// Incoming generation request, shared across all integrations.
///
/// Which fields are required depends on the flow: the remix flow needs
/// `image_url`, the video flow needs `prompt`, the chat flow accepts either.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub options: Value,
}

/// Mutable scratchpad threaded through the steps of one generation run.
///
/// Steps write what later steps and the completion check need: the page
/// they drive, intermediate vendor ids, and finally the vendor-side
/// request identifier the poll loop keys on.
#[derive(Default)]
pub struct FlowContext {
    pub prompt: Option<String>,
    pub image_url: Option<String>,
    pub options: Value,
    pub page: Option<Arc<dyn BrowserPage>>,
    pub access_token: Option<String>,
    pub source_image: Option<Vec<u8>>,
    pub upload_id: Option<String>,
    pub caption: Option<String>,
    pub request_id: Option<String>,
    pub batch_size: usize,
}

impl FlowContext {
    pub fn from_request(request: &GenerateRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            image_url: request.image_url.clone(),
            options: request.options.clone(),
            batch_size: 1,
            ..Self::default()
        }
    }
}

/// One completed artifact discovered by a completion check.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactPayload {
    /// Already publicly reachable; stored as-is.
    Reference(String),
    /// Raw bytes the gateway must persist itself before a reference exists.
    Bytes {
        key: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

impl ArtifactPayload {
    /// Stable identity used by the poll loop to skip artifacts it has
    /// already reported on an earlier attempt.
    pub fn key(&self) -> &str {
        match self {
            Self::Reference(url) => url,
            Self::Bytes { key, .. } => key,
        }
    }
}

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("browser session lost: {0}")]
    SessionLost(String),
    #[error("vendor endpoint returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("vendor protocol error: {0}")]
    Protocol(String),
    #[error("network error: {0}")]
    Network(String),
}

impl VendorError {
    /// Errors that mean the browser session itself is unusable, as opposed
    /// to the vendor rejecting this particular request.
    pub fn is_session_class(&self) -> bool {
        matches!(self, Self::SessionLost(_))
    }
}

/// Synchronous admission failure; the caller gets a 400 and no job record.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("{0}")]
    InvalidRequest(String),
}

/// A single vendor-side step of a generation flow: open a page, upload an
/// image, submit a prompt. Steps run in order and may be retried once with
/// a fresh session when they fail with a session-class error.
#[async_trait]
pub trait VendorAction: Send + Sync {
    fn name(&self) -> &'static str;

    async fn perform(
        &self,
        session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError>;
}

/// One poll-loop probe against the vendor: report every artifact visible
/// right now. The poll loop handles dedup across attempts, budgets, and
/// job-record transitions.
#[async_trait]
pub trait CompletionCheck: Send + Sync {
    async fn check(
        &self,
        session: &SessionHandle,
        ctx: &FlowContext,
    ) -> Result<Vec<ArtifactPayload>, VendorError>;
}

/// Everything the orchestrator needs to run one generation end to end.
///
/// The expected artifact count rides in the context (`batch_size`): the
/// factory seeds it and submit steps overwrite it when the vendor
/// advertises the real batch size.
pub struct GenerationPlan {
    pub context: FlowContext,
    pub steps: Vec<Arc<dyn VendorAction>>,
    pub check: Arc<dyn CompletionCheck>,
    pub poll: PollSettings,
}

/// Service-level request counters surfaced by the health endpoint.
#[derive(Debug, Default)]
pub struct GatewayStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl GatewayStats {
    pub fn record_accepted(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}
