use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::api::error::ErrorKind;
use crate::api::handler_utils::{error_response, map_admission_error, ApiObject};
use crate::api::server::AppState;
use crate::runtime::GenerateRequest;
use crate::vendors::Integration;

/// POST /api/integrations/{integration}/generate
///
/// Validation is the only synchronous part. A request that passes it is
/// accepted immediately with a job id; the browser work runs behind the
/// integration's limiter.
pub async fn generate_handler(
    State(state): State<AppState>,
    Path(integration): Path<String>,
    Json(payload): Json<Value>,
) -> ApiObject<Value> {
    let Some(integration) = Integration::from_slug(&integration) else {
        return error_response(
            StatusCode::NOT_FOUND,
            ErrorKind::Validation,
            "unknown_integration",
            format!("unknown integration {integration:?}"),
        );
    };
    let Some(gateway) = state.gateways.get(&integration) else {
        return error_response(
            StatusCode::NOT_FOUND,
            ErrorKind::Infra,
            "integration_disabled",
            format!("integration {} is not wired up", integration.as_str()),
        );
    };

    let request: GenerateRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation,
                "invalid_body",
                err.to_string(),
            )
        }
    };

    let plan = match gateway.factory.build(&request) {
        Ok(plan) => plan,
        Err(err) => return map_admission_error(err),
    };
    let job_id = gateway.orchestrator.submit(plan);

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "ok": true,
            "job_id": job_id,
            "integration": integration.as_str(),
        })),
    )
}
