//! Local command execution scope map.

use super::{SensitiveArea, ToolHook};
use crate::engine::ElevationError;

/// # Errors
/// Returns `Validation` if a mapped scope is malformed.
pub fn hook() -> Result<ToolHook, ElevationError> {
    let mut hook = ToolHook::new("desktop", "desktop:admin")?
        .with_command("sudo", &["desktop:admin"])?
        .with_command("rm -rf", &["desktop:delete:recursive"])?
        .with_command("rm -r", &["desktop:delete:recursive"])?
        .with_command("kill", &["desktop:process:kill"])?
        .with_command("killall", &["desktop:process:kill"])?
        .with_command("pkill", &["desktop:process:kill"])?
        .with_command("chmod", &["desktop:permissions"])?
        .with_command("chown", &["desktop:permissions"])?
        .with_command("shutdown", &["desktop:power"])?
        .with_command("reboot", &["desktop:power"])?
        .with_command("launchctl", &["desktop:services"])?
        .with_command("systemctl", &["desktop:services"])?;
    for path in ["/etc", "/usr/bin", "/usr/sbin", "/System", "/Library", "/boot"] {
        hook = hook.with_sensitive_area(SensitiveArea::PathPrefix(path.to_string()));
    }
    for process in ["launchd", "systemd", "sshd", "loginwindow"] {
        hook = hook.with_sensitive_area(SensitiveArea::Named(process.to_string()));
    }
    Ok(hook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::parse_scopes;
    use anyhow::Result;

    #[test]
    fn recursive_delete_in_system_path() -> Result<()> {
        let hook = hook()?;
        assert_eq!(
            hook.required_scopes("rm -rf /etc/nginx", Some("/etc/nginx")),
            parse_scopes(["desktop:delete:recursive", "desktop:admin"])?
        );
        assert_eq!(
            hook.required_scopes("rm -rf build", Some("/home/dev/build")),
            parse_scopes(["desktop:delete:recursive"])?
        );
        Ok(())
    }

    #[test]
    fn killing_system_process_is_sensitive() -> Result<()> {
        let hook = hook()?;
        assert!(hook.is_sensitive("launchd"));
        assert!(!hook.is_sensitive("node"));
        assert!(hook.required_scopes("ls -la", Some("/home/dev")).is_empty());
        Ok(())
    }
}
