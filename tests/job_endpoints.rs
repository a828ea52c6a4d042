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
async fn unknown_job_is_404() {
    let app = test_router(vec![StubFlow::succeeding(Integration::Remix, vec![])]);

    let body = send_json(
        app,
        Method::GET,
        "/api/jobs/remix-does-not-exist",
        Body::empty(),
        StatusCode::NOT_FOUND,
    )
    .await;

    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["error_code"], json!("not_found"));
}

#[tokio::test]
async fn completed_job_exposes_the_lifecycle_fields() {
    let app = test_router(vec![StubFlow::succeeding(
        Integration::Remix,
        vec![String::from("https://vendor.example/r.png")],
    )]);

    let accepted = send_json(
        app.clone(),
        Method::POST,
        "/api/integrations/remix/generate",
        Body::from(json!({"prompt": "neon skyline"}).to_string()),
        StatusCode::ACCEPTED,
    )
    .await;
    let job_id = accepted["job_id"].as_str().expect("job id").to_string();

    let settled = wait_for_terminal(&app, &job_id).await;
    let job = &settled["job"];
    assert_eq!(job["job_id"], json!(job_id));
    assert_eq!(job["integration"], json!("remix"));
    assert_eq!(job["status"], json!("completed"));
    assert_eq!(job["results"], json!(["https://vendor.example/r.png"]));
    assert!(job["created_at"].is_string());
    assert!(job["updated_at"].is_string());
    assert!(job.get("error_message").is_none());
}

#[tokio::test]
async fn failed_job_carries_its_error_message() {
    let app = test_router(vec![StubFlow::failing(
        Integration::Video,
        "vendor refused the prompt",
    )]);

    let accepted = send_json(
        app.clone(),
        Method::POST,
        "/api/integrations/video/generate",
        Body::from(json!({"prompt": "a slow zoom"}).to_string()),
        StatusCode::ACCEPTED,
    )
    .await;
    let job_id = accepted["job_id"].as_str().expect("job id").to_string();

    let settled = wait_for_terminal(&app, &job_id).await;
    assert_eq!(settled["job"]["status"], json!("failed"));
    let message = settled["job"]["error_message"]
        .as_str()
        .expect("error message");
    assert!(message.contains("vendor refused the prompt"));
}

#[tokio::test]
async fn jobs_listing_is_newest_first() {
    let app = test_router(vec![StubFlow::succeeding(
        Integration::Remix,
        vec![String::from("https://vendor.example/r.png")],
    )]);

    let first = send_json(
        app.clone(),
        Method::POST,
        "/api/integrations/remix/generate",
        Body::from(json!({"prompt": "one"}).to_string()),
        StatusCode::ACCEPTED,
    )
    .await;
    let second = send_json(
        app.clone(),
        Method::POST,
        "/api/integrations/remix/generate",
        Body::from(json!({"prompt": "two"}).to_string()),
        StatusCode::ACCEPTED,
    )
    .await;

    let listing = send_json(app, Method::GET, "/api/jobs", Body::empty(), StatusCode::OK).await;
    let jobs = listing["jobs"].as_array().expect("jobs array");
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["job_id"], second["job_id"]);
    assert_eq!(jobs[1]["job_id"], first["job_id"]);
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

    fn failing(integration: Integration, message: &'static str) -> Self {
        Self {
            integration,
            artifacts: Vec::new(),
            fail_with: Some(message),
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
    let root = std::env::temp_dir().join(format!("artgen_job_test_{}", Uuid::new_v4()));
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
