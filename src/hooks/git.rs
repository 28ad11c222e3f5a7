//! Source control scope map. Protected branches and CI definitions are the
//! sensitive areas.

use super::{SensitiveArea, ToolHook};
use crate::engine::ElevationError;

/// # Errors
/// Returns `Validation` if a mapped scope is malformed.
pub fn hook() -> Result<ToolHook, ElevationError> {
    Ok(ToolHook::new("git", "git:push:protected")?
        .with_value_options(&["-C", "-c", "--git-dir", "--work-tree", "--namespace"])
        .with_leading_flags(&["--no-pager", "-p", "--paginate", "--bare", "--no-replace-objects"])
        .with_command("clone", &["git:read"])?
        .with_command("fetch", &["git:read"])?
        .with_command("pull", &["git:read"])?
        .with_command("push", &["git:write"])?
        .with_command("push --force", &["git:push:force"])?
        .with_command("push -f", &["git:push:force"])?
        .with_command("push --force-with-lease", &["git:push:force"])?
        .with_command("push --delete", &["git:branch:delete"])?
        .with_command("branch -D", &["git:branch:delete"])?
        .with_command("reset --hard", &["git:history:rewrite"])?
        .with_command("rebase", &["git:history:rewrite"])?
        .with_command("filter-branch", &["git:history:rewrite"])?
        .with_command("tag -d", &["git:tag:delete"])?
        .with_sensitive_area(SensitiveArea::Named("main".to_string()))
        .with_sensitive_area(SensitiveArea::Named("master".to_string()))
        .with_sensitive_area(SensitiveArea::Named("production".to_string()))
        .with_sensitive_area(SensitiveArea::Named("CODEOWNERS".to_string()))
        .with_sensitive_area(SensitiveArea::PathPrefix(".github/workflows".to_string())))
}
