//! Acting identity for decision and revocation endpoints.
//!
//! Flow Overview: the authenticating gateway in front of this service verifies
//! the caller and forwards the subject and tenant in `x-elevation-subject` and
//! `x-elevation-tenant`. The gateway must strip both headers from inbound
//! client traffic. Approve, deny and revoke take the acting identity from here,
//! never from the request body.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};

use super::ErrorResponse;

pub const SUBJECT_HEADER: &str = "x-elevation-subject";
pub const TENANT_HEADER: &str = "x-elevation-tenant";

/// Authenticated caller as asserted by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub tenant_id: String,
}

impl Principal {
    /// Read the gateway headers; both must be present and non-blank.
    ///
    /// # Errors
    /// Returns `MissingPrincipal` naming the first absent header.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, MissingPrincipal> {
        Ok(Self {
            subject: header_value(headers, SUBJECT_HEADER)?,
            tenant_id: header_value(headers, TENANT_HEADER)?,
        })
    }
}

fn header_value(headers: &HeaderMap, name: &'static str) -> Result<String, MissingPrincipal> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .ok_or(MissingPrincipal(name))
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = MissingPrincipal;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers)
    }
}

/// Rejection when the gateway did not assert a caller.
#[derive(Debug, PartialEq, Eq)]
pub struct MissingPrincipal(pub &'static str);

impl IntoResponse for MissingPrincipal {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: "unauthenticated".to_string(),
            message: format!("missing {} header", self.0),
            elevation_id: None,
            challenge_id: None,
            mfa_method: None,
            missing_scopes: Vec::new(),
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}
