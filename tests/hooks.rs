mod common;

use anyhow::Result;
use common::{Harness, MOCAMBIQUE_TENANT, request};
use elevation::{
    engine::{Deadline, ElevationError, Market, RevokerContext},
    hooks::{HookDecision, HookError, HookInvocation, HookRegistry},
};
use secrecy::SecretString;

fn invocation(
    command: &str,
    target: Option<&str>,
    credential: Option<&SecretString>,
) -> Result<HookInvocation> {
    Ok(HookInvocation {
        command: command.to_string(),
        target: target.map(str::to_string),
        credential: credential.cloned(),
        tenant_id: MOCAMBIQUE_TENANT.to_string(),
        market: Market::parse("mocambique")?,
        resource_path: None,
    })
}

#[tokio::test]
async fn harmless_commands_skip_the_engine() -> Result<()> {
    let harness = Harness::new();
    let registry = HookRegistry::builtin()?;

    let decision = registry
        .check(
            "docker",
            &*harness.engine,
            &invocation("ps -a", None, None)?,
            Deadline::none(),
        )
        .await?;
    assert_eq!(decision, HookDecision::NotRequired);
    Ok(())
}

#[tokio::test]
async fn privileged_command_without_token_asks_for_elevation() -> Result<()> {
    let harness = Harness::new();
    let registry = HookRegistry::builtin()?;

    let result = registry
        .check(
            "docker",
            &*harness.engine,
            &invocation("system prune -af", None, None)?,
            Deadline::none(),
        )
        .await;
    let Err(HookError::ElevationRequired { tool, scopes }) = result else {
        anyhow::bail!("expected elevation to be required");
    };
    assert_eq!(tool, "docker");
    assert_eq!(scopes, vec!["docker:system".to_string()]);

    let unknown = registry
        .check(
            "docker",
            &*harness.engine,
            &invocation(
                "system prune -af",
                None,
                Some(&SecretString::from("elev_not-a-real-token".to_string())),
            )?,
            Deadline::none(),
        )
        .await;
    assert!(matches!(unknown, Err(HookError::ElevationRequired { .. })));
    Ok(())
}

#[tokio::test]
async fn option_spellings_do_not_bypass_docker_elevation() -> Result<()> {
    let harness = Harness::new();
    let registry = HookRegistry::builtin()?;

    for (command, scope) in [
        ("run --privileged=true alpine sh", "docker:run:privileged"),
        ("-H tcp://host:2375 system prune -af", "docker:system"),
        ("--context prod system prune", "docker:system"),
    ] {
        let result = registry
            .check(
                "docker",
                &*harness.engine,
                &invocation(command, None, None)?,
                Deadline::none(),
            )
            .await;
        let Err(HookError::ElevationRequired { scopes, .. }) = result else {
            anyhow::bail!("`{command}` ran without elevation");
        };
        assert_eq!(scopes, vec![scope.to_string()], "{command}");
    }

    let chained = registry
        .check(
            "docker",
            &*harness.engine,
            &invocation("ps && docker system prune -af", None, None)?,
            Deadline::none(),
        )
        .await;
    let Err(HookError::ElevationRequired { scopes, .. }) = chained else {
        anyhow::bail!("chained command ran without elevation");
    };
    assert!(scopes.contains(&"docker:system".to_string()));
    Ok(())
}

#[tokio::test]
async fn elevated_docker_prune_is_allowed() -> Result<()> {
    let harness = Harness::new();
    let registry = HookRegistry::builtin()?;
    let mut req = request("sre-1", MOCAMBIQUE_TENANT, "mocambique", &["docker:system"])?;
    req.emergency = true;
    let issued = harness.issue(req).await?;

    let decision = registry
        .check(
            "docker",
            &*harness.engine,
            &invocation("system prune -af", None, Some(&issued.credential))?,
            Deadline::none(),
        )
        .await?;
    let HookDecision::Allowed(result) = decision else {
        anyhow::bail!("expected the command to be allowed");
    };
    assert_eq!(result.elevation_id, issued.token.id);
    assert!(result.emergency);
    Ok(())
}

#[tokio::test]
async fn push_to_protected_branch_needs_the_extra_scope() -> Result<()> {
    let harness = Harness::new();
    let registry = HookRegistry::builtin()?;
    let issued = harness
        .issue(request("dev-1", MOCAMBIQUE_TENANT, "mocambique", &["git:write"])?)
        .await?;

    let feature = registry
        .check(
            "git",
            &*harness.engine,
            &invocation("push origin feature/login", Some("feature/login"), Some(&issued.credential))?,
            Deadline::none(),
        )
        .await?;
    assert!(matches!(feature, HookDecision::Allowed(_)));

    let main = registry
        .check(
            "git",
            &*harness.engine,
            &invocation("push origin main", Some("main"), Some(&issued.credential))?,
            Deadline::none(),
        )
        .await;
    let Err(HookError::ElevationRequired { scopes, .. }) = main else {
        anyhow::bail!("expected the protected branch scope to be required");
    };
    assert_eq!(scopes, vec!["git:push:protected".to_string()]);
    Ok(())
}

#[tokio::test]
async fn revoked_token_is_denied_not_retried() -> Result<()> {
    let harness = Harness::new();
    let registry = HookRegistry::builtin()?;
    let issued = harness
        .issue(request("designer-1", MOCAMBIQUE_TENANT, "mocambique", &["figma:delete:file"])?)
        .await?;
    harness
        .engine
        .revoke_elevation(
            &RevokerContext {
                revoked_by: "security-1".to_string(),
                tenant_id: MOCAMBIQUE_TENANT.to_string(),
            },
            issued.token.id,
            "contract ended",
            Deadline::none(),
        )
        .await?;

    let result = registry
        .check(
            "figma",
            &*harness.engine,
            &invocation("delete file", None, Some(&issued.credential))?,
            Deadline::none(),
        )
        .await;
    assert!(matches!(
        result,
        Err(HookError::Denied(ElevationError::TokenRevoked))
    ));

    let unknown_tool = registry
        .check(
            "terraform",
            &*harness.engine,
            &invocation("destroy", None, Some(&issued.credential))?,
            Deadline::none(),
        )
        .await;
    assert!(matches!(unknown_tool, Err(HookError::UnknownTool(_))));
    Ok(())
}
