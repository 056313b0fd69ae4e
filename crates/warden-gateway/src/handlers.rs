use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use warden_common::request::{normalize_parameters, validate_tenant_id};
use warden_common::{ActionTarget, ExecutionRequest};

use crate::auth::{require_role, AuthContext, Role};
use crate::responses::{ApiError, ExecuteResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBody {
    pub tenant_id: Option<String>,
    pub action_target: Option<String>,
    pub parameters: Option<Value>,
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateBody {
    pub action_target: String,
    pub version: Option<String>,
}

fn parse_execute(body: ExecuteBody, st: &AppState) -> Result<ExecutionRequest, ApiError> {
    let request_id = body.request_id.filter(|id| !id.is_empty());
    let invalid = |msg: String| ApiError::validation(msg, request_id.clone());

    let tenant_id = body
        .tenant_id
        .ok_or_else(|| invalid("tenantId is required".to_string()))?;
    validate_tenant_id(&tenant_id).map_err(invalid)?;

    let target: ActionTarget = body
        .action_target
        .ok_or_else(|| invalid("actionTarget is required".to_string()))?
        .parse()
        .map_err(|e| invalid(format!("{e}")))?;

    let parameters = normalize_parameters(body.parameters).map_err(invalid)?;
    let tier = st.supervisor.quota().tier_for(&tenant_id);

    Ok(ExecutionRequest::new(
        tenant_id,
        target,
        parameters,
        tier,
        request_id,
    ))
}

pub async fn execute(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return resp;
    }

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return ApiError::validation(rejection.body_text(), None).into_response(),
    };
    let request = match parse_execute(body, &st) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    let request_id = request.request_id.clone();
    match st.supervisor.execute(request).await {
        Ok(result) => (
            StatusCode::OK,
            Json(ExecuteResponse { request_id, result }),
        )
            .into_response(),
        Err(error) => ApiError::new(error, Some(request_id)).into_response(),
    }
}

pub async fn health(State(st): State<AppState>) -> impl IntoResponse {
    let report = st.supervisor.health();
    let status = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub async fn stats(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    (StatusCode::OK, Json(st.supervisor.stats())).into_response()
}

pub async fn invalidate(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    body: Result<Json<InvalidateBody>, JsonRejection>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Admin) {
        return resp;
    }

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return ApiError::validation(rejection.body_text(), None).into_response(),
    };
    // Accept either `summarize` + version or `summarize@v2`.
    let target: ActionTarget = match body.action_target.parse() {
        Ok(t) => t,
        Err(e) => return ApiError::validation(format!("{e}"), None).into_response(),
    };
    let version = body.version.or(target.version);

    let removed = st.supervisor.invalidate(&target.action, version.as_deref());
    tracing::info!(principal = %ctx.principal, action = %target.action, removed, "cache invalidation requested");
    (StatusCode::OK, Json(json!({ "removed": removed }))).into_response()
}
