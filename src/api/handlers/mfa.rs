use axum::{
    Json,
    extract::{Extension, Path},
    http::HeaderMap,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ApiError, ErrorResponse, deadline_from};
use crate::engine::ElevationEngine;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChallengeResponse {
    pub response: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChallengeResult {
    pub challenge_id: Uuid,
    pub verified: bool,
}

#[utoipa::path(
    post,
    path = "/v1/mfa/challenges/{challenge_id}/verify",
    params(("challenge_id" = Uuid, Path, description = "Challenge id from the 401 response")),
    request_body = ChallengeResponse,
    responses(
        (status = 200, description = "Response checked; `verified` reports the outcome.", body = ChallengeResult),
        (status = 401, description = "Unknown, expired or exhausted challenge.", body = ErrorResponse),
    ),
    tag = "mfa"
)]
pub async fn verify_challenge(
    Path(challenge_id): Path<Uuid>,
    headers: HeaderMap,
    engine: Extension<Arc<ElevationEngine>>,
    Json(payload): Json<ChallengeResponse>,
) -> Result<impl IntoResponse, ApiError> {
    let deadline = deadline_from(&headers, &engine);
    let verified = engine
        .verify_mfa_challenge(challenge_id, payload.response.trim(), deadline)
        .await?;
    Ok(Json(ChallengeResult {
        challenge_id,
        verified,
    }))
}
