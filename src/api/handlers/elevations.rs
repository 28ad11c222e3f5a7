//! Elevation lifecycle endpoints.
//!
//! Flow Overview:
//! 1) `POST /v1/elevations` submits a request. The bearer credential is in the
//!    response body exactly once; an MFA gate answers 401 with the challenge id
//!    and the client resubmits with `mfa_challenge_id` after verifying it.
//! 2) Approvers call `approve` / `deny`; an owner or admin calls `revoke`. The
//!    acting identity comes from the gateway-asserted `Principal`.
//! 3) Reads are always scoped by `tenant_id`; another tenant's elevation is a 404.

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::{ApiError, ErrorResponse, deadline_from, principal::Principal, validation};
use crate::engine::{
    ApproverContext, ElevationEngine, ElevationRequest, ElevationStatus, ElevationToken, Market,
    MfaMethod, RevokerContext, duration::parse_duration, types::parse_scopes,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct RequestContext {
    pub tenant_id: String,
    pub market: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateElevationRequest {
    pub user_id: String,
    pub requested_scopes: Vec<String>,
    pub justification: String,
    /// ISO-8601 duration (`PT30M`) or `Ns`/`Nm`/`Nh`; omitted means the policy maximum.
    pub duration: Option<String>,
    #[serde(default)]
    pub emergency_access: bool,
    pub context: RequestContext,
    pub mfa_challenge_id: Option<Uuid>,
    pub mfa_method: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateElevationResponse {
    pub elevation_id: Uuid,
    pub elevation_token: String,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub approval_deadline: Option<DateTime<Utc>>,
    pub elevated_scopes: Vec<String>,
    pub requires_mfa: bool,
    pub duration_clamped: bool,
    pub notification_failed: bool,
    pub emergency: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ElevationResponse {
    pub elevation_id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub market: String,
    pub status: String,
    pub granted_scopes: Vec<String>,
    pub justification: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approval_deadline: Option<DateTime<Utc>>,
    pub approver_id: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub revocation_reason: Option<String>,
    pub emergency: bool,
    pub use_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub policy_version: i64,
}

impl From<ElevationToken> for ElevationResponse {
    fn from(token: ElevationToken) -> Self {
        Self {
            elevation_id: token.id,
            user_id: token.user_id,
            tenant_id: token.tenant_id,
            market: token.market.to_string(),
            status: token.status.as_str().to_string(),
            granted_scopes: token
                .granted_scopes
                .iter()
                .map(ToString::to_string)
                .collect(),
            justification: token.justification,
            created_at: token.created_at,
            expires_at: token.expires_at,
            approval_deadline: token.approval_deadline,
            approver_id: token.approver_id,
            approved_at: token.approved_at,
            decision_reason: token.decision_reason,
            revoked_at: token.revoked_at,
            revoked_by: token.revoked_by,
            revocation_reason: token.revocation_reason,
            emergency: token.emergency_auto_approved,
            use_count: token.use_count,
            last_used_at: token.last_used_at,
            policy_version: token.policy_version,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TenantParams {
    pub tenant_id: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListParams {
    pub user_id: String,
    pub tenant_id: String,
}

/// The approver and tenant come from the `Principal`; identity fields in the
/// body are ignored.
#[derive(Debug, Deserialize, ToSchema)]
pub struct DecisionRequest {
    pub reason: Option<String>,
}

/// The revoker and tenant come from the `Principal`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeRequest {
    pub reason: String,
}

fn into_request(payload: CreateElevationRequest) -> Result<ElevationRequest, ApiError> {
    let duration = payload
        .duration
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(parse_duration)
        .transpose()?;
    let mfa_method = match payload.mfa_method.as_deref() {
        Some(method) => {
            Some(MfaMethod::from_str(method).ok_or_else(|| validation("unknown mfa_method"))?)
        }
        None => None,
    };
    Ok(ElevationRequest {
        user_id: payload.user_id,
        tenant_id: payload.context.tenant_id,
        market: Market::parse(&payload.context.market)?,
        scopes: parse_scopes(&payload.requested_scopes)?,
        justification: payload.justification,
        duration,
        emergency: payload.emergency_access,
        mfa_challenge_id: payload.mfa_challenge_id,
        mfa_method,
    })
}

#[utoipa::path(
    post,
    path = "/v1/elevations",
    request_body = CreateElevationRequest,
    params(("x-elevation-deadline-ms" = Option<u64>, Header, description = "Request deadline in milliseconds")),
    responses(
        (status = 201, description = "Elevation active.", body = CreateElevationResponse),
        (status = 202, description = "Elevation awaiting approval.", body = CreateElevationResponse),
        (status = 400, description = "Invalid request.", body = ErrorResponse),
        (status = 401, description = "MFA challenge issued or failed.", body = ErrorResponse),
        (status = 504, description = "Deadline elapsed.", body = ErrorResponse),
    ),
    tag = "elevations"
)]
pub async fn create_elevation(
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    Json(payload): Json<CreateElevationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let request = into_request(payload)?;
    let issued = engine.request_elevation(request, deadline).await?;

    let status = if issued.token.status == ElevationStatus::PendingApproval {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    let token = issued.token;
    let response = CreateElevationResponse {
        elevation_id: token.id,
        elevation_token: issued.credential.expose_secret().to_string(),
        status: token.status.as_str().to_string(),
        expires_at: token.expires_at,
        approval_deadline: token.approval_deadline,
        elevated_scopes: token
            .granted_scopes
            .iter()
            .map(ToString::to_string)
            .collect(),
        requires_mfa: issued.requires_mfa,
        duration_clamped: issued.duration_clamped,
        notification_failed: issued.notification_failed,
        emergency: token.emergency_auto_approved,
    };
    Ok((status, Json(response)))
}

#[utoipa::path(
    get,
    path = "/v1/elevations",
    params(ListParams),
    responses(
        (status = 200, description = "Active elevations for the user in the tenant.", body = [ElevationResponse]),
        (status = 400, description = "Missing user or tenant.", body = ErrorResponse),
    ),
    tag = "elevations"
)]
pub async fn list_active(
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let tokens = engine
        .list_active_elevations(&params.user_id, &params.tenant_id, deadline)
        .await?;
    let body: Vec<ElevationResponse> = tokens.into_iter().map(ElevationResponse::from).collect();
    Ok(Json(body))
}

#[utoipa::path(
    get,
    path = "/v1/elevations/{elevation_id}",
    params(
        ("elevation_id" = Uuid, Path, description = "Elevation id"),
        TenantParams
    ),
    responses(
        (status = 200, description = "Elevation detail.", body = ElevationResponse),
        (status = 404, description = "Not found in this tenant.", body = ErrorResponse),
    ),
    tag = "elevations"
)]
pub async fn get_elevation(
    Path(elevation_id): Path<Uuid>,
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    Query(params): Query<TenantParams>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let token = engine
        .get_elevation_token(elevation_id, &params.tenant_id, deadline)
        .await?;
    Ok(Json(ElevationResponse::from(token)))
}

#[utoipa::path(
    post,
    path = "/v1/elevations/{elevation_id}/approve",
    params(
        ("elevation_id" = Uuid, Path, description = "Elevation id"),
        ("x-elevation-subject" = String, Header, description = "Caller id asserted by the gateway"),
        ("x-elevation-tenant" = String, Header, description = "Caller tenant asserted by the gateway")
    ),
    request_body = DecisionRequest,
    responses(
        (status = 200, description = "Elevation approved and active.", body = ElevationResponse),
        (status = 401, description = "No caller asserted.", body = ErrorResponse),
        (status = 404, description = "Not found in this tenant.", body = ErrorResponse),
        (status = 409, description = "Not pending, or self-approval.", body = ErrorResponse),
    ),
    tag = "elevations"
)]
pub async fn approve_elevation(
    Path(elevation_id): Path<Uuid>,
    principal: Principal,
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    Json(_decision): Json<DecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let approver = ApproverContext {
        approver_id: principal.subject,
        tenant_id: principal.tenant_id,
    };
    let token = engine
        .approve_elevation(&approver, elevation_id, deadline)
        .await?;
    Ok(Json(ElevationResponse::from(token)))
}

#[utoipa::path(
    post,
    path = "/v1/elevations/{elevation_id}/deny",
    params(
        ("elevation_id" = Uuid, Path, description = "Elevation id"),
        ("x-elevation-subject" = String, Header, description = "Caller id asserted by the gateway"),
        ("x-elevation-tenant" = String, Header, description = "Caller tenant asserted by the gateway")
    ),
    request_body = DecisionRequest,
    responses(
        (status = 200, description = "Elevation denied.", body = ElevationResponse),
        (status = 401, description = "No caller asserted.", body = ErrorResponse),
        (status = 404, description = "Not found in this tenant.", body = ErrorResponse),
        (status = 409, description = "Not pending.", body = ErrorResponse),
    ),
    tag = "elevations"
)]
pub async fn deny_elevation(
    Path(elevation_id): Path<Uuid>,
    principal: Principal,
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    Json(payload): Json<DecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let approver = ApproverContext {
        approver_id: principal.subject,
        tenant_id: principal.tenant_id,
    };
    let token = engine
        .deny_elevation(&approver, elevation_id, payload.reason, deadline)
        .await?;
    Ok(Json(ElevationResponse::from(token)))
}

#[utoipa::path(
    post,
    path = "/v1/elevations/{elevation_id}/revoke",
    params(
        ("elevation_id" = Uuid, Path, description = "Elevation id"),
        ("x-elevation-subject" = String, Header, description = "Caller id asserted by the gateway"),
        ("x-elevation-tenant" = String, Header, description = "Caller tenant asserted by the gateway")
    ),
    request_body = RevokeRequest,
    responses(
        (status = 200, description = "Elevation revoked.", body = ElevationResponse),
        (status = 401, description = "No caller asserted.", body = ErrorResponse),
        (status = 403, description = "Already expired, denied or revoked.", body = ErrorResponse),
        (status = 404, description = "Not found in this tenant.", body = ErrorResponse),
    ),
    tag = "elevations"
)]
pub async fn revoke_elevation(
    Path(elevation_id): Path<Uuid>,
    principal: Principal,
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    Json(payload): Json<RevokeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let revoker = RevokerContext {
        revoked_by: principal.subject,
        tenant_id: principal.tenant_id,
    };
    let token = engine
        .revoke_elevation(&revoker, elevation_id, &payload.reason, deadline)
        .await?;
    Ok(Json(ElevationResponse::from(token)))
}
