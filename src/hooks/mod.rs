//! Tool hook adapters.
//!
//! Flow Overview:
//! 1) A tool registers a `ToolHook`: a static `command -> scopes` map and the
//!    sensitive areas (paths, processes, branches) it protects.
//! 2) Before running a command the tool calls `HookRegistry::check`.
//! 3) Commands that map to no scope and touch nothing sensitive pass without
//!    consulting the engine.
//! 4) Everything else goes through one `Authorizer::authorize` call. Missing
//!    or insufficient credentials surface as `HookError::ElevationRequired`;
//!    the hook never retries on its own.

use secrecy::SecretString;
use std::{collections::BTreeMap, fmt};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::engine::{
    BoxFuture, Deadline, ElevationEngine, ElevationError, Market, Scope, ScopeAuthorizer,
    ScopeSet, VerificationRequest, VerificationResult, types::parse_scopes,
};

pub mod desktop;
pub mod docker;
pub mod figma;
pub mod git;

/// The single capability every tool adapter needs from the core.
pub trait Authorizer: Send + Sync {
    fn authorize<'a>(
        &'a self,
        request: &'a VerificationRequest,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<VerificationResult, ElevationError>>;
}

impl Authorizer for ScopeAuthorizer {
    fn authorize<'a>(
        &'a self,
        request: &'a VerificationRequest,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<VerificationResult, ElevationError>> {
        Box::pin(self.verify(request, deadline))
    }
}

impl Authorizer for ElevationEngine {
    fn authorize<'a>(
        &'a self,
        request: &'a VerificationRequest,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<VerificationResult, ElevationError>> {
        Box::pin(self.verify(request, deadline))
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("elevation required for scope {}", scopes.join(", "))]
    ElevationRequired { tool: String, scopes: Vec<String> },
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    Denied(#[from] ElevationError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookDecision {
    /// Nothing privileged about this command.
    NotRequired,
    Allowed(VerificationResult),
}

/// One command a tool is about to run, plus the caller's identity.
#[derive(Clone)]
pub struct HookInvocation {
    pub command: String,
    /// Path, process, branch or file the command acts on.
    pub target: Option<String>,
    pub credential: Option<SecretString>,
    pub tenant_id: String,
    pub market: Market,
    pub resource_path: Option<String>,
}

impl fmt::Debug for HookInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookInvocation")
            .field("command", &self.command)
            .field("target", &self.target)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .field("tenant_id", &self.tenant_id)
            .field("market", &self.market)
            .field("resource_path", &self.resource_path)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SensitiveArea {
    /// Filesystem or API path prefix, matched on segment boundaries.
    PathPrefix(String),
    /// Exact name: a process, branch or file.
    Named(String),
}

impl SensitiveArea {
    #[must_use]
    pub fn matches(&self, target: &str) -> bool {
        match self {
            Self::PathPrefix(prefix) => {
                let prefix = prefix.trim_end_matches('/');
                target == prefix
                    || target
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            Self::Named(name) => target == name,
        }
    }
}

/// Characters that chain or substitute commands. A hook cannot tell what such a
/// line will run, so it is treated as unparseable.
const SHELL_CONTROL: &[&str] = &[";", "|", "&", "`", "$(", "\n"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Flag {
    name: String,
    value: Option<String>,
}

impl Flag {
    /// Split one option word. `--name=value` carries its value; a short
    /// cluster such as `-af` expands to `-a -f`.
    fn split(word: &str) -> Vec<Self> {
        if let Some(long) = word.strip_prefix("--") {
            let (name, value) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (long, None),
            };
            return vec![Self {
                name: format!("--{name}"),
                value,
            }];
        }
        let short = word.trim_start_matches('-');
        if short.chars().count() <= 1 {
            return vec![Self {
                name: word.to_string(),
                value: None,
            }];
        }
        short
            .chars()
            .map(|c| Self {
                name: format!("-{c}"),
                value: None,
            })
            .collect()
    }

    /// A pattern flag without a value matches any value.
    fn satisfies(&self, wanted: &Self) -> bool {
        self.name == wanted.name
            && wanted
                .value
                .as_deref()
                .map_or(true, |value| self.value.as_deref() == Some(value))
    }
}

/// Words of a mapped command. Positional words must prefix the invocation's
/// positional words (case-insensitively); flags may appear anywhere.
#[derive(Clone, Debug, Default)]
struct CommandPattern {
    positional: Vec<String>,
    flags: Vec<Flag>,
}

impl CommandPattern {
    fn parse(pattern: &str) -> Self {
        let mut parsed = Self::default();
        for word in pattern.split_whitespace() {
            if word.starts_with('-') {
                parsed.flags.extend(Flag::split(word));
            } else {
                parsed.positional.push(word.to_ascii_lowercase());
            }
        }
        parsed
    }

    fn matches(&self, command: &CommandPattern) -> bool {
        command.positional.len() >= self.positional.len()
            && self
                .positional
                .iter()
                .zip(&command.positional)
                .all(|(want, have)| want == have)
            && self
                .flags
                .iter()
                .all(|wanted| command.flags.iter().any(|flag| flag.satisfies(wanted)))
    }

    fn specificity(&self) -> usize {
        self.positional.len() + self.flags.len()
    }
}

/// Scope map and sensitivity predicate for one tool.
#[derive(Clone, Debug)]
pub struct ToolHook {
    name: String,
    commands: Vec<(CommandPattern, ScopeSet)>,
    sensitive_areas: Vec<SensitiveArea>,
    sensitive_scope: Scope,
    /// Options whose value may follow as the next word (`-H tcp://host`).
    value_options: Vec<String>,
    /// Options allowed before the first positional word without a value.
    leading_flags: Vec<String>,
}

impl ToolHook {
    /// # Errors
    /// Returns `Validation` if `sensitive_scope` is not a valid scope.
    pub fn new(name: &str, sensitive_scope: &str) -> Result<Self, ElevationError> {
        Ok(Self {
            name: name.to_string(),
            commands: Vec::new(),
            sensitive_areas: Vec::new(),
            sensitive_scope: Scope::parse(sensitive_scope)?,
            value_options: Vec::new(),
            leading_flags: Vec::new(),
        })
    }

    /// # Errors
    /// Returns `Validation` for an invalid scope.
    pub fn with_command(mut self, pattern: &str, scopes: &[&str]) -> Result<Self, ElevationError> {
        self.commands
            .push((CommandPattern::parse(pattern), parse_scopes(scopes.iter().copied())?));
        Ok(self)
    }

    #[must_use]
    pub fn with_sensitive_area(mut self, area: SensitiveArea) -> Self {
        self.sensitive_areas.push(area);
        self
    }

    /// Options that take a separate value word, anywhere in the command.
    #[must_use]
    pub fn with_value_options(mut self, options: &[&str]) -> Self {
        self.value_options
            .extend(options.iter().map(|option| (*option).to_string()));
        self
    }

    /// Value-less options the tool accepts before its subcommand. Any other
    /// option in that position makes the command unparseable.
    #[must_use]
    pub fn with_leading_flags(mut self, flags: &[&str]) -> Self {
        self.leading_flags
            .extend(flags.iter().map(|flag| (*flag).to_string()));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_sensitive(&self, target: &str) -> bool {
        self.sensitive_areas.iter().any(|area| area.matches(target))
    }

    /// `None` when the command cannot be split into subcommand words and
    /// options with certainty.
    fn parse_invocation(&self, command: &str) -> Option<CommandPattern> {
        if command.trim().is_empty() || SHELL_CONTROL.iter().any(|op| command.contains(op)) {
            return None;
        }

        let mut parsed = CommandPattern::default();
        let mut words = command.split_whitespace();
        let mut options_ended = false;
        while let Some(word) = words.next() {
            if word == "--" && !options_ended {
                options_ended = true;
                continue;
            }
            if options_ended || word == "-" || !word.starts_with('-') {
                parsed.positional.push(word.to_ascii_lowercase());
                continue;
            }

            let mut flags = Flag::split(word);
            let leading = parsed.positional.is_empty();
            let known = |name: &str| {
                self.value_options.iter().any(|option| option == name)
                    || self.leading_flags.iter().any(|flag| flag == name)
            };
            if leading && !flags.iter().all(|flag| known(&flag.name)) {
                return None;
            }
            if let Some(last) = flags.last_mut() {
                if last.value.is_none()
                    && self.value_options.iter().any(|option| *option == last.name)
                {
                    last.value = words.next().map(str::to_string);
                }
            }
            parsed.flags.extend(flags);
        }
        Some(parsed)
    }

    /// Every scope the tool maps, for commands that cannot be parsed.
    fn broadest_scopes(&self) -> ScopeSet {
        self.commands
            .iter()
            .flat_map(|(_, scopes)| scopes.iter().cloned())
            .collect()
    }

    /// Scopes needed to run `command` against `target`. The most specific
    /// mapping wins; a sensitive target, or an option value naming a
    /// sensitive area (`-v /var/run/docker.sock:/sock`), adds the tool's
    /// sensitive scope. Unparseable commands need every mapped scope.
    #[must_use]
    pub fn required_scopes(&self, command: &str, target: Option<&str>) -> ScopeSet {
        let Some(invocation) = self.parse_invocation(command) else {
            debug!(tool = %self.name, "command not parseable, requiring every mapped scope");
            let mut scopes = self.broadest_scopes();
            if target.is_some_and(|target| self.is_sensitive(target)) {
                scopes.insert(self.sensitive_scope.clone());
            }
            return scopes;
        };

        let mut scopes = self
            .commands
            .iter()
            .filter(|(pattern, _)| pattern.matches(&invocation))
            .max_by_key(|(pattern, _)| pattern.specificity())
            .map(|(_, scopes)| scopes.clone())
            .unwrap_or_default();

        let touches_sensitive = target.is_some_and(|target| self.is_sensitive(target))
            || invocation
                .flags
                .iter()
                .filter_map(|flag| flag.value.as_deref())
                .any(|value| {
                    self.is_sensitive(value)
                        || value
                            .split(':')
                            .next()
                            .is_some_and(|host_side| self.is_sensitive(host_side))
                });
        if touches_sensitive {
            scopes.insert(self.sensitive_scope.clone());
        }
        scopes
    }

    /// Authorize one invocation.
    ///
    /// # Errors
    /// Returns `ElevationRequired` when the caller has no credential, an
    /// unknown one, or one lacking scopes. Every other engine refusal is
    /// passed through as `Denied`.
    #[instrument(skip(self, authorizer, invocation, deadline), fields(tool = %self.name, command = %invocation.command))]
    pub async fn check(
        &self,
        authorizer: &dyn Authorizer,
        invocation: &HookInvocation,
        deadline: Deadline,
    ) -> Result<HookDecision, HookError> {
        let required = self.required_scopes(&invocation.command, invocation.target.as_deref());
        if required.is_empty() {
            debug!("command needs no elevation");
            return Ok(HookDecision::NotRequired);
        }

        let Some(credential) = invocation.credential.clone() else {
            return Err(self.elevation_required(&required));
        };

        let request = VerificationRequest {
            credential,
            required_scopes: required.clone(),
            caller_tenant: invocation.tenant_id.clone(),
            caller_market: invocation.market.clone(),
            operation: format!("{} {}", self.name, invocation.command.trim()),
            resource_path: invocation.resource_path.clone(),
        };

        match authorizer.authorize(&request, deadline).await {
            Ok(result) => Ok(HookDecision::Allowed(result)),
            Err(ElevationError::TokenNotFound) => Err(self.elevation_required(&required)),
            Err(ElevationError::InsufficientScope { missing }) => {
                Err(HookError::ElevationRequired {
                    tool: self.name.clone(),
                    scopes: missing,
                })
            }
            Err(err) => Err(HookError::Denied(err)),
        }
    }

    fn elevation_required(&self, scopes: &ScopeSet) -> HookError {
        HookError::ElevationRequired {
            tool: self.name.clone(),
            scopes: scopes.iter().map(Scope::to_string).collect(),
        }
    }
}

/// Registered tools, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct HookRegistry {
    tools: BTreeMap<String, ToolHook>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Docker, desktop command, git and Figma adapters.
    ///
    /// # Errors
    /// Returns `Validation` if a built-in scope map is malformed.
    pub fn builtin() -> Result<Self, ElevationError> {
        let mut registry = Self::new();
        registry.register(docker::hook()?);
        registry.register(desktop::hook()?);
        registry.register(git::hook()?);
        registry.register(figma::hook()?);
        Ok(registry)
    }

    pub fn register(&mut self, hook: ToolHook) {
        self.tools.insert(hook.name().to_string(), hook);
    }

    #[must_use]
    pub fn get(&self, tool: &str) -> Option<&ToolHook> {
        self.tools.get(tool)
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// # Errors
    /// Returns `UnknownTool` or anything [`ToolHook::check`] returns.
    pub async fn check(
        &self,
        tool: &str,
        authorizer: &dyn Authorizer,
        invocation: &HookInvocation,
        deadline: Deadline,
    ) -> Result<HookDecision, HookError> {
        let hook = self
            .get(tool)
            .ok_or_else(|| HookError::UnknownTool(tool.to_string()))?;
        hook.check(authorizer, invocation, deadline).await
    }
}
