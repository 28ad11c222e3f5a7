mod common;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    http::{
        HeaderMap, Method, Request, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE},
        request::Builder,
    },
};
use common::{ANGOLA_TENANT, Harness, MOCAMBIQUE_TENANT};
use elevation::{
    api::{
        self,
        handlers::principal::{SUBJECT_HEADER, TENANT_HEADER},
    },
    hooks::HookRegistry,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

struct Client {
    app: Router,
}

impl Client {
    fn new(harness: &Harness) -> Result<Self> {
        Ok(Self {
            app: api::app(harness.engine.clone(), Arc::new(HookRegistry::builtin()?)),
        })
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        self.dispatch(builder, body).await
    }

    /// Call as a caller the gateway has already authenticated.
    async fn send_as(
        &self,
        method: Method,
        uri: &str,
        (subject, tenant_id): (&str, &str),
        body: Option<Value>,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(SUBJECT_HEADER, subject)
            .header(TENANT_HEADER, tenant_id);
        self.dispatch(builder, body).await
    }

    async fn dispatch(
        &self,
        builder: Builder,
        body: Option<Value>,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await?.to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, headers, json))
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("missing {key} in {value}"))
}

#[tokio::test]
async fn health_reports_memory_backend() -> Result<()> {
    let harness = Harness::new();
    let client = Client::new(&harness)?;

    let (status, headers, body) = client.send(Method::GET, "/health", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(str_field(&body, "storage")?, "ok");
    assert_eq!(str_field(&body, "storage_backend")?, "memory");
    assert!(headers
        .get("X-App")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("elevation:")));

    let (status, _, body) = client.send(Method::OPTIONS, "/health", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);
    Ok(())
}

#[tokio::test]
async fn immediate_grant_then_verify() -> Result<()> {
    let harness = Harness::new();
    let client = Client::new(&harness)?;

    let (status, _, created) = client
        .send(
            Method::POST,
            "/v1/elevations",
            None,
            Some(json!({
                "user_id": "designer-1",
                "requested_scopes": ["figma:delete:file"],
                "justification": "remove leaked mockups",
                "duration": "PT2H",
                "context": {"tenant_id": MOCAMBIQUE_TENANT, "market": "mocambique"}
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(str_field(&created, "status")?, "active");
    assert_eq!(created.get("duration_clamped"), Some(&Value::Bool(true)));
    let credential = str_field(&created, "elevation_token")?.to_string();
    let elevation_id = str_field(&created, "elevation_id")?.to_string();

    let verify = json!({
        "required_scopes": ["figma:delete:file"],
        "tenant_id": MOCAMBIQUE_TENANT,
        "market": "mocambique",
        "operation": "figma delete file"
    });
    let (status, _, result) = client
        .send(Method::POST, "/v1/verify", Some(&credential), Some(verify.clone()))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result.get("allowed"), Some(&Value::Bool(true)));
    assert_eq!(result.get("use_count"), Some(&Value::from(1)));

    let (status, _, error) = client
        .send(Method::POST, "/v1/verify", None, Some(verify))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(str_field(&error, "error")?, "token_not_found");

    let (status, _, error) = client
        .send(
            Method::GET,
            &format!("/v1/elevations/{elevation_id}?tenant_id={ANGOLA_TENANT}"),
            None,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(str_field(&error, "error")?, "tenant_isolation_violation");

    let (status, _, listed) = client
        .send(
            Method::GET,
            &format!("/v1/elevations?user_id=designer-1&tenant_id={MOCAMBIQUE_TENANT}"),
            None,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn mfa_then_approval_over_http() -> Result<()> {
    let harness = Harness::new();
    let client = Client::new(&harness)?;
    let mut payload = json!({
        "user_id": "dev-1",
        "requested_scopes": ["docker:system"],
        "justification": "disk full on build host",
        "context": {"tenant_id": ANGOLA_TENANT, "market": "angola"}
    });

    let (status, _, challenge) = client
        .send(Method::POST, "/v1/elevations", None, Some(payload.clone()))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(str_field(&challenge, "error")?, "mfa_required");
    let challenge_id: Uuid = str_field(&challenge, "challenge_id")?.parse()?;

    let code = harness.notifier.code_for(challenge_id)?;
    let (status, _, verified) = client
        .send(
            Method::POST,
            &format!("/v1/mfa/challenges/{challenge_id}/verify"),
            None,
            Some(json!({"response": code})),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verified.get("verified"), Some(&Value::Bool(true)));

    payload["mfa_challenge_id"] = Value::from(challenge_id.to_string());
    let (status, _, created) = client
        .send(Method::POST, "/v1/elevations", None, Some(payload))
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(str_field(&created, "status")?, "pending_approval");
    let elevation_id = str_field(&created, "elevation_id")?.to_string();
    let credential = str_field(&created, "elevation_token")?.to_string();

    let (status, _, error) = client
        .send(
            Method::POST,
            "/v1/verify",
            Some(&credential),
            Some(json!({
                "required_scopes": ["docker:system"],
                "tenant_id": ANGOLA_TENANT,
                "market": "angola",
                "operation": "docker system prune"
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(str_field(&error, "error")?, "approval_required");

    let approve = format!("/v1/elevations/{elevation_id}/approve");
    let (status, _, error) = client
        .send(Method::POST, &approve, None, Some(json!({})))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(str_field(&error, "error")?, "unauthenticated");

    // Identity in the body does not override the asserted caller.
    let (status, _, error) = client
        .send_as(
            Method::POST,
            &approve,
            ("dev-1", ANGOLA_TENANT),
            Some(json!({"approver_id": "lead-1", "tenant_id": ANGOLA_TENANT})),
        )
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(str_field(&error, "error")?, "self_approval_denied");

    let (status, _, _) = client
        .send_as(
            Method::POST,
            &approve,
            ("lead-2", "tenant-angola-456"),
            Some(json!({"tenant_id": ANGOLA_TENANT})),
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, approved) = client
        .send_as(Method::POST, &approve, ("lead-1", ANGOLA_TENANT), Some(json!({})))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(str_field(&approved, "status")?, "active");
    assert_eq!(str_field(&approved, "approver_id")?, "lead-1");

    let (status, _, events) = client
        .send(
            Method::GET,
            &format!("/v1/audit/events?elevation_id={elevation_id}"),
            None,
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = events
        .as_array()
        .map(|events| {
            events
                .iter()
                .filter_map(|event| event.get("event_type").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    assert!(kinds.contains(&"elevation_requested"));
    assert!(kinds.contains(&"elevation_approved"));
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected() -> Result<()> {
    let harness = Harness::new();
    let client = Client::new(&harness)?;

    let (status, _, error) = client
        .send(
            Method::POST,
            "/v1/elevations",
            None,
            Some(json!({
                "user_id": "dev-1",
                "requested_scopes": ["Not A Scope"],
                "justification": "x",
                "context": {"tenant_id": ANGOLA_TENANT, "market": "angola"}
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(str_field(&error, "error")?, "validation_error");

    let (status, _, _) = client
        .send_as(
            Method::POST,
            &format!("/v1/elevations/{}/revoke", Uuid::new_v4()),
            ("security-1", ANGOLA_TENANT),
            Some(json!({"reason": "cleanup"})),
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn hook_check_without_token_requires_elevation() -> Result<()> {
    let harness = Harness::new();
    let client = Client::new(&harness)?;

    let (status, _, body) = client
        .send(
            Method::POST,
            "/v1/hooks/docker/check",
            None,
            Some(json!({
                "command": "system prune -af",
                "tenant_id": ANGOLA_TENANT,
                "market": "angola"
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body.get("elevation_required"), Some(&Value::Bool(true)));
    assert_eq!(body.get("required_scopes"), Some(&json!(["docker:system"])));

    let (status, _, _) = client
        .send(
            Method::POST,
            "/v1/hooks/kubectl/check",
            None,
            Some(json!({
                "command": "delete ns prod",
                "tenant_id": ANGOLA_TENANT,
                "market": "angola"
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}
