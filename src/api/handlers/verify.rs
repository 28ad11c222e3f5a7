//! Verification endpoint used by remote tool hooks.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ApiError, ErrorResponse, bearer_credential, deadline_from};
use crate::engine::{
    ElevationEngine, ElevationError, Market, VerificationRequest, VerificationResult,
    types::parse_scopes,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyRequest {
    pub required_scopes: Vec<String>,
    pub tenant_id: String,
    pub market: String,
    pub operation: String,
    pub resource_path: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    pub allowed: bool,
    pub elevation_id: Uuid,
    pub user_id: String,
    pub exercised_scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub remaining_seconds: i64,
    pub emergency: bool,
    pub use_count: i64,
}

impl From<VerificationResult> for VerifyResponse {
    fn from(result: VerificationResult) -> Self {
        Self {
            allowed: result.allowed,
            elevation_id: result.elevation_id,
            user_id: result.user_id,
            exercised_scopes: result
                .exercised_scopes
                .iter()
                .map(ToString::to_string)
                .collect(),
            expires_at: result.expires_at,
            remaining_seconds: result.remaining_seconds,
            emergency: result.emergency,
            use_count: result.use_count,
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/verify",
    request_body = VerifyRequest,
    params(("x-elevation-deadline-ms" = Option<u64>, Header, description = "Request deadline in milliseconds")),
    responses(
        (status = 200, description = "Operation authorized.", body = VerifyResponse),
        (status = 202, description = "Elevation still awaiting approval.", body = ErrorResponse),
        (status = 403, description = "Expired, revoked, denied or insufficient scope.", body = ErrorResponse),
        (status = 404, description = "Unknown token or tenant isolation violation.", body = ErrorResponse),
    ),
    tag = "verify"
)]
pub async fn verify(
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    Json(payload): Json<VerifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let credential = bearer_credential(&headers).ok_or(ElevationError::TokenNotFound)?;
    let request = VerificationRequest {
        credential,
        required_scopes: parse_scopes(&payload.required_scopes)?,
        caller_tenant: payload.tenant_id,
        caller_market: Market::parse(&payload.market)?,
        operation: payload.operation,
        resource_path: payload.resource_path,
    };
    let result = engine.verify(&request, deadline).await?;
    Ok((StatusCode::OK, Json(VerifyResponse::from(result))))
}
