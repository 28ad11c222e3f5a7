//! Administrative policy endpoints. Not on the authorization hot path.

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::{ApiError, ErrorResponse, validation};
use crate::engine::{ComplianceRegistration, ElevationEngine, Market, MfaLevel};

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterComplianceRequest {
    pub market: String,
    pub framework: String,
    pub requires_approval: bool,
    /// `none`, `basic`, `standard` or `phishing_resistant`.
    pub minimum_mfa_level: String,
    pub retention_years: u32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PolicyVersion {
    pub version: i64,
}

#[utoipa::path(
    get,
    path = "/v1/policies",
    responses(
        (status = 200, description = "Current policy snapshot.", content_type = "application/json"),
    ),
    tag = "policies"
)]
pub async fn snapshot(engine: Extension<Arc<ElevationEngine>>) -> impl IntoResponse {
    let snapshot = engine.policies().snapshot();
    Json(snapshot.as_ref().clone())
}

#[utoipa::path(
    post,
    path = "/v1/policies/compliance",
    request_body = RegisterComplianceRequest,
    responses(
        (status = 201, description = "Compliance profile registered.", body = PolicyVersion),
        (status = 400, description = "Invalid registration.", body = ErrorResponse),
    ),
    tag = "policies"
)]
pub async fn register_compliance(
    engine: Extension<Arc<ElevationEngine>>,
    Json(payload): Json<RegisterComplianceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let minimum_mfa_level = MfaLevel::from_str(&payload.minimum_mfa_level)
        .ok_or_else(|| validation("unknown minimum_mfa_level"))?;
    let version = engine.register_compliance_policy(ComplianceRegistration {
        market: Market::parse(&payload.market)?,
        framework: payload.framework,
        requires_approval: payload.requires_approval,
        minimum_mfa_level,
        retention_years: payload.retention_years,
    })?;
    Ok((StatusCode::CREATED, Json(PolicyVersion { version })))
}
