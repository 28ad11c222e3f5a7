//! HTTP handlers and the shared error/deadline plumbing.
//!
//! Engine errors map onto a small, stable JSON body: `error` carries the
//! `ErrorKind` code and `message` the caller-safe reason. Tenant isolation
//! violations answer 404 so a caller cannot learn that an elevation exists in
//! another tenant.

pub mod audit;
pub mod elevations;
pub mod health;
pub mod hooks;
pub mod mfa;
pub mod policies;
pub mod principal;
pub mod verify;

use axum::{
    Json,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use serde::Serialize;
use std::time::Duration;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::{Deadline, ElevationEngine, ElevationError, ErrorKind};

pub const DEADLINE_HEADER: &str = "x-elevation-deadline-ms";

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa_method: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_scopes: Vec<String>,
}

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ElevationError);

impl From<ElevationError> for ApiError {
    fn from(err: ElevationError) -> Self {
        Self(err)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::MfaRequired | ErrorKind::MfaChallengeFailed => StatusCode::UNAUTHORIZED,
        ErrorKind::ApprovalRequired => StatusCode::ACCEPTED,
        ErrorKind::NotPendingApproval | ErrorKind::SelfApprovalDenied => StatusCode::CONFLICT,
        ErrorKind::TokenNotFound | ErrorKind::TenantIsolationViolation => StatusCode::NOT_FOUND,
        ErrorKind::TokenExpired
        | ErrorKind::TokenRevoked
        | ErrorKind::TokenDenied
        | ErrorKind::InsufficientScope => StatusCode::FORBIDDEN,
        ErrorKind::DurationExceedsPolicy => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::PolicyNotFound | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }

        let mut body = ErrorResponse {
            error: kind.as_str().to_string(),
            message: self.0.public_message(),
            elevation_id: None,
            challenge_id: None,
            mfa_method: None,
            missing_scopes: Vec::new(),
        };
        match self.0 {
            ElevationError::MfaRequired {
                challenge_id,
                method,
            } => {
                body.challenge_id = Some(challenge_id);
                body.mfa_method = Some(method.as_str().to_string());
            }
            ElevationError::ApprovalRequired { elevation_id }
            | ElevationError::NotPendingApproval { elevation_id, .. } => {
                body.elevation_id = Some(elevation_id);
            }
            ElevationError::Timeout { elevation_id, .. } => body.elevation_id = elevation_id,
            ElevationError::InsufficientScope { missing } => body.missing_scopes = missing,
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

/// Per-request deadline from `x-elevation-deadline-ms`, else the configured default.
pub fn deadline_from(headers: &HeaderMap, engine: &ElevationEngine) -> Deadline {
    headers
        .get(DEADLINE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|millis| *millis > 0)
        .map_or_else(
            || engine.config().default_deadline(),
            |millis| Deadline::after(Duration::from_millis(millis)),
        )
}

/// Bearer credential from the `Authorization` header.
pub fn bearer_credential(headers: &HeaderMap) -> Option<SecretString> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credential) = value.split_once(' ')?;
    let credential = credential.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !credential.is_empty() {
        Some(SecretString::from(credential.to_string()))
    } else {
        None
    }
}

pub fn validation(message: &str) -> ApiError {
    ApiError(ElevationError::Validation(message.to_string()))
}
