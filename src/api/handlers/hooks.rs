//! Remote form of the tool hook check, for adapters that run out of process.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::{ApiError, ErrorResponse, bearer_credential, deadline_from, verify::VerifyResponse};
use crate::{
    engine::{ElevationEngine, Market},
    hooks::{HookDecision, HookError, HookInvocation, HookRegistry},
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct HookCheckRequest {
    pub command: String,
    pub target: Option<String>,
    pub tenant_id: String,
    pub market: String,
    pub resource_path: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HookCheckResponse {
    pub tool: String,
    pub elevation_required: bool,
    pub required_scopes: Vec<String>,
    pub verification: Option<VerifyResponse>,
}

#[utoipa::path(
    post,
    path = "/v1/hooks/{tool}/check",
    params(("tool" = String, Path, description = "docker, desktop, git or figma")),
    request_body = HookCheckRequest,
    responses(
        (status = 200, description = "Command may run.", body = HookCheckResponse),
        (status = 403, description = "Elevation required, or the token was refused.", body = HookCheckResponse),
        (status = 404, description = "Unknown tool.", body = ErrorResponse),
    ),
    tag = "hooks"
)]
pub async fn check(
    Path(tool): Path<String>,
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    registry: Extension<Arc<HookRegistry>>,
    Json(payload): Json<HookCheckRequest>,
) -> Result<Response, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let invocation = HookInvocation {
        command: payload.command,
        target: payload.target,
        credential: bearer_credential(&headers),
        tenant_id: payload.tenant_id,
        market: Market::parse(&payload.market)?,
        resource_path: payload.resource_path,
    };

    let authorizer: &ElevationEngine = &engine;
    let outcome = registry.check(&tool, authorizer, &invocation, deadline).await;
    match outcome {
        Ok(HookDecision::NotRequired) => Ok(Json(HookCheckResponse {
            tool,
            elevation_required: false,
            required_scopes: Vec::new(),
            verification: None,
        })
        .into_response()),
        Ok(HookDecision::Allowed(result)) => Ok(Json(HookCheckResponse {
            tool,
            elevation_required: false,
            required_scopes: result
                .exercised_scopes
                .iter()
                .map(ToString::to_string)
                .collect(),
            verification: Some(VerifyResponse::from(result)),
        })
        .into_response()),
        Err(HookError::ElevationRequired { tool, scopes }) => Ok((
            StatusCode::FORBIDDEN,
            Json(HookCheckResponse {
                tool,
                elevation_required: true,
                required_scopes: scopes,
                verification: None,
            }),
        )
            .into_response()),
        Err(HookError::UnknownTool(_)) => Ok(StatusCode::NOT_FOUND.into_response()),
        Err(HookError::Denied(err)) => Err(ApiError(err)),
    }
}
