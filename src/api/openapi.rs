use crate::api::handlers::{audit, elevations, health, hooks, mfa, policies, verify};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Router that also drives the `OpenAPI` document.
///
/// Register endpoints here via `.routes(routes!(...))` so they are both served
/// and documented. `OPTIONS /health` is added outside and stays undocumented.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(
            elevations::create_elevation,
            elevations::list_active
        ))
        .routes(routes!(elevations::get_elevation))
        .routes(routes!(elevations::approve_elevation))
        .routes(routes!(elevations::deny_elevation))
        .routes(routes!(elevations::revoke_elevation))
        .routes(routes!(verify::verify))
        .routes(routes!(mfa::verify_challenge))
        .routes(routes!(audit::query_events))
        .routes(routes!(policies::snapshot))
        .routes(routes!(policies::register_compliance))
        .routes(routes!(hooks::check));

    router.get_openapi_mut().tags = Some(
        [
            ("elevations", "Request, approve, deny and revoke elevations"),
            ("verify", "Authorization hot path for tool hooks"),
            ("mfa", "MFA challenge responses"),
            ("audit", "Compliance reporting"),
            ("policies", "Market compliance policy administration"),
            ("hooks", "Tool hook checks for out-of-process adapters"),
            ("health", "Service health"),
        ]
        .into_iter()
        .map(|(name, description)| {
            let mut tag = Tag::new(name);
            tag.description = Some(description.to_string());
            tag
        })
        .collect(),
    );

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact(env!("CARGO_PKG_AUTHORS"));
    info.license = optional_str(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

/// First Cargo author (`;` separated, `Name <email>`) as an `OpenAPI` contact.
fn cargo_contact(authors: &str) -> Option<Contact> {
    let primary = optional_str(authors.split(';').next()?)?;
    let (name, email) = match primary.split_once('<') {
        Some((name, email)) => (optional_str(name), optional_str(email.trim_end_matches('>'))),
        None => (Some(primary), None),
    };
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
