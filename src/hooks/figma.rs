//! Design tool scope map.

use super::{SensitiveArea, ToolHook};
use crate::engine::ElevationError;

/// # Errors
/// Returns `Validation` if a mapped scope is malformed.
pub fn hook() -> Result<ToolHook, ElevationError> {
    Ok(ToolHook::new("figma", "figma:write:library")?
        .with_command("get file", &["figma:read:file"])?
        .with_command("export file", &["figma:read:file"])?
        .with_command("update file", &["figma:write:file"])?
        .with_command("delete file", &["figma:delete:file"])?
        .with_command("delete component", &["figma:delete:component"])?
        .with_command("share file", &["figma:share:file"])?
        .with_command("publish library", &["figma:write:library"])?
        .with_sensitive_area(SensitiveArea::PathPrefix("/libraries".to_string()))
        .with_sensitive_area(SensitiveArea::PathPrefix("/design-system".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::parse_scopes;
    use anyhow::Result;

    #[test]
    fn delete_file_scope() -> Result<()> {
        let hook = hook()?;
        assert_eq!(
            hook.required_scopes("delete file abc123", None),
            parse_scopes(["figma:delete:file"])?
        );
        assert_eq!(
            hook.required_scopes("update file abc123", Some("/design-system/tokens")),
            parse_scopes(["figma:write:file", "figma:write:library"])?
        );
        Ok(())
    }
}
