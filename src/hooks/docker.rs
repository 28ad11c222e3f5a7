//! Docker CLI scope map.

use super::{SensitiveArea, ToolHook};
use crate::engine::ElevationError;

const GLOBAL_VALUE_OPTIONS: &[&str] = &[
    "-H",
    "--host",
    "-c",
    "--context",
    "--config",
    "-l",
    "--log-level",
    "--tlscacert",
    "--tlscert",
    "--tlskey",
];

const GLOBAL_FLAGS: &[&str] = &["-D", "--debug", "--tls", "--tlsverify"];

/// Container options whose value is the next word, so it is not mistaken for
/// the image or command.
const RUN_VALUE_OPTIONS: &[&str] = &[
    "-e",
    "--env",
    "-v",
    "--volume",
    "--mount",
    "--name",
    "-p",
    "--publish",
    "-u",
    "--user",
    "-w",
    "--workdir",
    "--entrypoint",
    "--network",
    "--net",
    "--pid",
    "--ipc",
    "--uts",
    "--userns",
    "--cap-add",
    "--device",
    "--security-opt",
];

/// Options that hand a container host-level privileges.
const PRIVILEGED_RUN_OPTIONS: &[&str] = &[
    "--privileged",
    "--pid=host",
    "--ipc=host",
    "--uts=host",
    "--userns=host",
    "--network=host",
    "--net=host",
    "--cap-add",
    "--device",
    "--security-opt",
];

/// # Errors
/// Returns `Validation` if a mapped scope is malformed.
pub fn hook() -> Result<ToolHook, ElevationError> {
    let mut hook = ToolHook::new("docker", "docker:system")?
        .with_value_options(GLOBAL_VALUE_OPTIONS)
        .with_value_options(RUN_VALUE_OPTIONS)
        .with_leading_flags(GLOBAL_FLAGS)
        .with_command("system prune", &["docker:system"])?
        .with_command("swarm leave", &["docker:system"])?
        .with_command("swarm init", &["docker:system"])?
        .with_command("volume rm", &["docker:volume:delete"])?
        .with_command("volume prune", &["docker:volume:delete"])?
        .with_command("network rm", &["docker:network:delete"])?
        .with_command("rm", &["docker:container:delete"])?
        .with_command("container rm", &["docker:container:delete"])?
        .with_command("rmi", &["docker:image:delete"])?
        .with_command("image rm", &["docker:image:delete"])?
        .with_command("exec", &["docker:exec"])?
        .with_command("container exec", &["docker:exec"])?;
    for run in ["run", "create", "container run", "container create"] {
        for option in PRIVILEGED_RUN_OPTIONS {
            hook = hook.with_command(&format!("{run} {option}"), &["docker:run:privileged"])?;
        }
    }
    Ok(hook
        .with_sensitive_area(SensitiveArea::PathPrefix("/var/run/docker.sock".to_string()))
        .with_sensitive_area(SensitiveArea::PathPrefix("/var/lib/docker".to_string()))
        .with_sensitive_area(SensitiveArea::Named("dockerd".to_string()))
        .with_sensitive_area(SensitiveArea::Named("containerd".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Scope, types::parse_scopes};
    use anyhow::Result;

    #[test]
    fn prune_needs_system_scope() -> Result<()> {
        let hook = hook()?;
        assert_eq!(
            hook.required_scopes("system prune -af", None),
            parse_scopes(["docker:system"])?
        );
        assert_eq!(
            hook.required_scopes("run --privileged alpine sh", None),
            parse_scopes(["docker:run:privileged"])?
        );
        assert!(hook.required_scopes("ps -a", None).is_empty());
        Ok(())
    }

    #[test]
    fn option_values_do_not_hide_the_subcommand() -> Result<()> {
        let hook = hook()?;
        let system = parse_scopes(["docker:system"])?;
        assert_eq!(
            hook.required_scopes("-H tcp://host:2375 system prune -af", None),
            system
        );
        assert_eq!(hook.required_scopes("--context prod system prune", None), system);
        assert_eq!(
            hook.required_scopes("--host=tcp://host:2375 --tls system prune", None),
            system
        );
        Ok(())
    }

    #[test]
    fn privileged_options_in_any_spelling() -> Result<()> {
        let hook = hook()?;
        let privileged = parse_scopes(["docker:run:privileged"])?;
        for command in [
            "run --privileged=true alpine sh",
            "run --pid host alpine",
            "run --pid=host alpine",
            "container run --net=host alpine",
            "create --cap-add SYS_ADMIN alpine",
            "run -it --privileged alpine",
        ] {
            assert_eq!(hook.required_scopes(command, None), privileged, "{command}");
        }
        assert!(hook.required_scopes("run --pid=container:web alpine", None).is_empty());
        assert!(hook.required_scopes("run -e MODE=host alpine", None).is_empty());
        Ok(())
    }

    #[test]
    fn socket_volume_is_sensitive() -> Result<()> {
        let hook = hook()?;
        assert_eq!(
            hook.required_scopes("run -v /var/run/docker.sock:/var/run/docker.sock alpine", None),
            parse_scopes(["docker:system"])?
        );
        Ok(())
    }

    #[test]
    fn unparseable_commands_need_every_scope() -> Result<()> {
        let hook = hook()?;
        let broadest = hook.required_scopes("ps; docker system prune -af", None);
        assert!(broadest.contains(&Scope::parse("docker:system")?));
        assert!(broadest.contains(&Scope::parse("docker:run:privileged")?));
        assert_eq!(hook.required_scopes("--unknown value system prune", None), broadest);
        assert_eq!(hook.required_scopes("   ", None), broadest);
        Ok(())
    }

    #[test]
    fn socket_mount_is_sensitive() -> Result<()> {
        let hook = hook()?;
        assert_eq!(
            hook.required_scopes("run alpine", Some("/var/run/docker.sock")),
            parse_scopes(["docker:system"])?
        );
        Ok(())
    }
}
