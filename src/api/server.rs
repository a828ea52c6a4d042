use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::handler_utils::ApiObject;
use crate::browser::chromium::ChromiumBackend;
use crate::config::GatewayConfig;
use crate::db::jobs::SqliteJobLedger;
use crate::db::resolve_ledger_config;
use crate::jobs::tracker::JobTracker;
use crate::runtime::limiter::ConcurrencyLimiter;
use crate::runtime::orchestrator::RequestOrchestrator;
use crate::runtime::session::{SessionBackend, SessionManager};
use crate::runtime::GatewayStats;
use crate::storage::DiskArtifactStore;
use crate::vendors::chat_image::{ChatImageFlow, ChatImageSettings};
use crate::vendors::prompt_image::{PromptImageFlow, PromptImageSettings};
use crate::vendors::remix::{RemixFlow, RemixSettings};
use crate::vendors::video::{VideoFlow, VideoSettings};
use crate::vendors::{FlowFactory, Integration};

/// One integration's admission seam and its background executor.
#[derive(Clone)]
pub struct IntegrationGateway {
    pub factory: Arc<dyn FlowFactory>,
    pub orchestrator: Arc<RequestOrchestrator>,
}

#[derive(Clone)]
pub struct AppState {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub stats: Arc<GatewayStats>,
    pub tracker: Arc<JobTracker>,
    pub gateways: Arc<HashMap<Integration, IntegrationGateway>>,
}

impl AppState {
    pub fn new(
        tracker: Arc<JobTracker>,
        stats: Arc<GatewayStats>,
        gateways: Arc<HashMap<Integration, IntegrationGateway>>,
    ) -> Self {
        Self {
            service_name: "artgen-gateway",
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            stats,
            tracker,
            gateways,
        }
    }
}

/// Production wiring: chromium sessions, sqlite ledger, disk artifacts.
pub fn build_router(config: &GatewayConfig) -> Router {
    let ledger = SqliteJobLedger::new(resolve_ledger_config(&config.data_root).db_path);
    ledger
        .initialize()
        .expect("job ledger should initialize schema");
    let artifacts_root = config.data_root.join("artifacts");
    let artifacts = Arc::new(DiskArtifactStore::new(
        artifacts_root.clone(),
        config.artifact_public_base.clone(),
    ));
    let tracker = Arc::new(JobTracker::new(artifacts, Some(Arc::new(ledger))));
    let stats = Arc::new(GatewayStats::default());
    let backend: Arc<dyn SessionBackend> = Arc::new(ChromiumBackend::new(config.chromium.clone()));
    let http = reqwest::Client::new();

    let factories: Vec<Arc<dyn FlowFactory>> = vec![
        Arc::new(ChatImageFlow::new(ChatImageSettings::default(), http.clone())),
        Arc::new(RemixFlow::new(RemixSettings::default(), http)),
        Arc::new(PromptImageFlow::new(PromptImageSettings::default())),
        Arc::new(VideoFlow::new(VideoSettings::default())),
    ];
    let mut gateways = HashMap::new();
    for factory in factories {
        let integration = factory.integration();
        let sessions = Arc::new(SessionManager::new(integration.as_str(), Arc::clone(&backend)));
        let orchestrator = Arc::new(RequestOrchestrator::new(
            integration,
            Arc::clone(&tracker),
            sessions,
            ConcurrencyLimiter::new(config.concurrency_limit),
            Arc::clone(&stats),
        ));
        gateways.insert(
            integration,
            IntegrationGateway {
                factory,
                orchestrator,
            },
        );
    }

    // Persisted artifacts are advertised below the public base; serve them
    // from the same process so those references resolve.
    build_router_with_parts(tracker, stats, gateways)
        .nest_service("/artifacts", ServeDir::new(artifacts_root))
}

/// Assembles the router from pre-built collaborators; tests inject fake
/// gateways here.
pub fn build_router_with_parts(
    tracker: Arc<JobTracker>,
    stats: Arc<GatewayStats>,
    gateways: HashMap<Integration, IntegrationGateway>,
) -> Router {
    let state = AppState::new(tracker, stats, Arc::new(gateways));
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/integrations/{integration}/generate",
            post(crate::api::generate::generate_handler),
        )
        .route("/api/jobs", get(crate::api::jobs::list_jobs_handler))
        .route("/api/jobs/{job_id}", get(crate::api::jobs::get_job_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, config: &GatewayConfig) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(config);
    info!(bind = %addr, "starting artgen-gateway HTTP surface");
    axum::serve(listener, app).await
}

async fn health_handler(State(state): State<AppState>) -> ApiObject<serde_json::Value> {
    let uptime_seconds = now_unix_ms().saturating_sub(state.started_unix_ms) / 1000;
    let mut integrations = serde_json::Map::new();
    for (integration, gateway) in state.gateways.iter() {
        integrations.insert(
            integration.as_str().to_string(),
            json!({ "active": gateway.orchestrator.active_count() }),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": "ok",
            "service": state.service_name,
            "version": state.service_version,
            "uptime_seconds": uptime_seconds,
            "total_requests": state.stats.total(),
            "successful_requests": state.stats.successful(),
            "failed_requests": state.stats.failed(),
            "integrations": integrations,
        })),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
