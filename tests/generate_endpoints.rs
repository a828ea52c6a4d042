use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use url::Url;
use uuid::Uuid;

use artgen_gateway::api::server::{build_router_with_parts, IntegrationGateway};
use artgen_gateway::browser::{BrowserPage, BrowserSession};
use artgen_gateway::jobs::tracker::JobTracker;
use artgen_gateway::runtime::limiter::ConcurrencyLimiter;
use artgen_gateway::runtime::orchestrator::RequestOrchestrator;
use artgen_gateway::runtime::poll::PollSettings;
use artgen_gateway::runtime::session::{
    LaunchedSession, SessionBackend, SessionError, SessionHandle, SessionManager,
};
use artgen_gateway::runtime::{
    AdmissionError, ArtifactPayload, CompletionCheck, FlowContext, GatewayStats, GenerateRequest,
    GenerationPlan, VendorAction, VendorError,
};
use artgen_gateway::storage::DiskArtifactStore;
use artgen_gateway::vendors::{FlowFactory, Integration};

#[tokio::test]
async fn accepted_request_returns_202_and_eventually_completes() {
    let app = test_router(vec![StubFlow::succeeding(
        Integration::PromptImage,
        vec![String::from("https://vendor.example/0.png")],
    )]);

    let accepted = send_json(
        app.clone(),
        Method::POST,
        "/api/integrations/prompt-image/generate",
        Body::from(json!({"prompt": "a castle at dawn"}).to_string()),
        StatusCode::ACCEPTED,
    )
    .await;

    assert_eq!(accepted["ok"], json!(true));
    assert_eq!(accepted["integration"], json!("prompt-image"));
    let job_id = accepted["job_id"].as_str().expect("job id").to_string();
    assert!(job_id.starts_with("prompt-image-"));

    let settled = wait_for_terminal(&app, &job_id).await;
    assert_eq!(settled["job"]["status"], json!("completed"));
    assert_eq!(
        settled["job"]["results"],
        json!(["https://vendor.example/0.png"])
    );
}

#[tokio::test]
async fn invalid_request_is_rejected_without_creating_a_job() {
    let app = test_router(vec![StubFlow::succeeding(Integration::PromptImage, vec![])]);

    let rejected = send_json(
        app.clone(),
        Method::POST,
        "/api/integrations/prompt-image/generate",
        Body::from(json!({}).to_string()),
        StatusCode::BAD_REQUEST,
    )
    .await;

    assert_eq!(rejected["ok"], json!(false));
    assert_eq!(rejected["error"], json!("prompt is required"));
    assert_eq!(rejected["error_kind"], json!("validation"));

    let listing = send_json(
        app,
        Method::GET,
        "/api/jobs",
        Body::empty(),
        StatusCode::OK,
    )
    .await;
    assert_eq!(listing["jobs"], json!([]));
}

#[tokio::test]
async fn unknown_integration_is_404() {
    let app = test_router(vec![StubFlow::succeeding(Integration::PromptImage, vec![])]);

    let body = send_json(
        app,
        Method::POST,
        "/api/integrations/midjourney/generate",
        Body::from(json!({"prompt": "x"}).to_string()),
        StatusCode::NOT_FOUND,
    )
    .await;

    assert_eq!(body["error_code"], json!("unknown_integration"));
}

#[tokio::test]
async fn malformed_body_is_a_validation_error() {
    let app = test_router(vec![StubFlow::succeeding(Integration::PromptImage, vec![])]);

    let body = send_json(
        app,
        Method::POST,
        "/api/integrations/prompt-image/generate",
        Body::from(json!({"prompt": 5}).to_string()),
        StatusCode::BAD_REQUEST,
    )
    .await;

    assert_eq!(body["error_code"], json!("invalid_body"));
}

struct StubFlow {
    integration: Integration,
    artifacts: Vec<String>,
    fail_with: Option<&'static str>,
}

impl StubFlow {
    fn succeeding(integration: Integration, artifacts: Vec<String>) -> Self {
        Self {
            integration,
            artifacts,
            fail_with: None,
        }
    }
}

impl FlowFactory for StubFlow {
    fn integration(&self) -> Integration {
        self.integration
    }

    fn build(&self, request: &GenerateRequest) -> Result<GenerationPlan, AdmissionError> {
        if request.prompt.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(AdmissionError::InvalidRequest(String::from(
                "prompt is required",
            )));
        }
        let step: Arc<dyn VendorAction> = match self.fail_with {
            Some(message) => Arc::new(FailingStep { message }),
            None => Arc::new(MintRequestId),
        };
        Ok(GenerationPlan {
            context: FlowContext::from_request(request),
            steps: vec![step],
            check: Arc::new(FixedCheck {
                artifacts: self.artifacts.clone(),
            }),
            poll: PollSettings {
                interval: Duration::from_millis(5),
                max_attempts: 3,
            },
        })
    }
}

struct MintRequestId;

#[async_trait]
impl VendorAction for MintRequestId {
    fn name(&self) -> &'static str {
        "mint-request-id"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        ctx.request_id = Some(String::from("req-1"));
        Ok(())
    }
}

struct FailingStep {
    message: &'static str,
}

#[async_trait]
impl VendorAction for FailingStep {
    fn name(&self) -> &'static str {
        "failing-step"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        _ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        Err(VendorError::Http {
            status: 500,
            message: self.message.to_string(),
        })
    }
}

struct FixedCheck {
    artifacts: Vec<String>,
}

#[async_trait]
impl CompletionCheck for FixedCheck {
    async fn check(
        &self,
        _session: &SessionHandle,
        _ctx: &FlowContext,
    ) -> Result<Vec<ArtifactPayload>, VendorError> {
        Ok(self
            .artifacts
            .iter()
            .cloned()
            .map(ArtifactPayload::Reference)
            .collect())
    }
}

struct NoPages;

#[async_trait]
impl BrowserSession for NoPages {
    async fn open_page(&self, _url: &str) -> Result<Box<dyn BrowserPage>, VendorError> {
        Err(VendorError::Protocol(String::from("no pages in tests")))
    }
}

struct InstantBackend;

#[async_trait]
impl SessionBackend for InstantBackend {
    async fn launch(&self) -> Result<LaunchedSession, SessionError> {
        Ok(LaunchedSession {
            connection: Arc::new(NoPages),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }
}

fn test_router(flows: Vec<StubFlow>) -> axum::Router {
    let root = std::env::temp_dir().join(format!("artgen_generate_test_{}", Uuid::new_v4()));
    let store = Arc::new(DiskArtifactStore::new(
        root,
        Url::parse("http://127.0.0.1:8790/artifacts").expect("base url"),
    ));
    let tracker = Arc::new(JobTracker::new(store, None));
    let stats = Arc::new(GatewayStats::default());

    let mut gateways = HashMap::new();
    for flow in flows {
        let integration = flow.integration;
        let sessions = Arc::new(SessionManager::new(
            integration.as_str(),
            Arc::new(InstantBackend) as Arc<dyn SessionBackend>,
        ));
        let orchestrator = Arc::new(RequestOrchestrator::new(
            integration,
            Arc::clone(&tracker),
            sessions,
            ConcurrencyLimiter::new(2),
            Arc::clone(&stats),
        ));
        gateways.insert(
            integration,
            IntegrationGateway {
                factory: Arc::new(flow),
                orchestrator,
            },
        );
    }
    build_router_with_parts(tracker, stats, gateways)
}

async fn wait_for_terminal(app: &axum::Router, job_id: &str) -> Value {
    for _ in 0..400 {
        let body = send_json(
            app.clone(),
            Method::GET,
            &format!("/api/jobs/{job_id}"),
            Body::empty(),
            StatusCode::OK,
        )
        .await;
        if matches!(
            body["job"]["status"].as_str(),
            Some("completed" | "failed" | "timeout")
        ) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} never settled");
}

async fn send_json(
    app: axum::Router,
    method: Method,
    uri: &str,
    body: Body,
    expected_status: StatusCode,
) -> Value {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .expect("request should build");

    let response = app
        .oneshot(request)
        .await
        .expect("router should return response");
    assert_eq!(response.status(), expected_status);

    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    serde_json::from_slice(body.as_ref()).expect("response should be valid JSON")
}
