//! Role/capability gate for lifecycle commands.
//!
//! The acting role is carried explicitly in [`ExecutionContext`], built once at
//! process start, so the gate is a pure function of its arguments.

use std::fmt;

use crate::error::LifecycleError;

/// Environment variable naming the acting role (`architect`, `executor`, ...).
pub const ROLE_ENV: &str = "DC_ROLE";
/// Environment variable naming the current runbook phase (`pre`, `post`).
pub const PHASE_ENV: &str = "DC_PHASE";

/// Who is acting, and in which runbook phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Lowercased role; `None` means an undeclared, trusted human operator.
    pub role: Option<String>,
    pub phase: Option<String>,
}

impl ExecutionContext {
    pub fn new(role: Option<&str>, phase: Option<&str>) -> Self {
        Self {
            role: clean(role),
            phase: clean(phase),
        }
    }

    /// Read `DC_ROLE` / `DC_PHASE` from the process environment.
    pub fn from_env() -> Self {
        let role = std::env::var(ROLE_ENV).ok();
        let phase = std::env::var(PHASE_ENV).ok();
        Self::new(role.as_deref(), phase.as_deref())
    }

    pub fn with_role(role: &str) -> Self {
        Self::new(Some(role), None)
    }
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

/// A class of commands owned by exactly one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Directive/task lifecycle commands and executor runbooks.
    ExecutorLifecycle,
    /// Directive/task authoring and the architect runbook.
    ArchitectAuthoring,
}

impl Capability {
    pub fn owner(self) -> &'static str {
        match self {
            Capability::ExecutorLifecycle => "executor",
            Capability::ArchitectAuthoring => "architect",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::ExecutorLifecycle => f.write_str("executor lifecycle"),
            Capability::ArchitectAuthoring => f.write_str("architect authoring"),
        }
    }
}

/// Reject `command` unless the acting role owns `required` (or no role is set).
pub fn assert_capability(
    required: Capability,
    ctx: &ExecutionContext,
    command: &str,
) -> Result<(), LifecycleError> {
    let Some(role) = ctx.role.as_deref() else {
        return Ok(());
    };
    if role == required.owner() {
        return Ok(());
    }
    Err(LifecycleError::CapabilityDenied {
        command: command.to_string(),
        role: role.to_string(),
        owner: required.owner().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undeclared_role_is_permissive() {
        let ctx = ExecutionContext::new(Some("  "), None);
        assert_eq!(ctx.role, None);
        assert!(assert_capability(Capability::ExecutorLifecycle, &ctx, "directive start").is_ok());
        assert!(assert_capability(Capability::ArchitectAuthoring, &ctx, "directive new").is_ok());
    }

    #[test]
    fn owner_role_passes_case_insensitively() {
        let ctx = ExecutionContext::new(Some("Executor"), Some("PRE"));
        assert_eq!(ctx.phase.as_deref(), Some("pre"));
        assert!(assert_capability(Capability::ExecutorLifecycle, &ctx, "task finish").is_ok());
    }

    #[test]
    fn other_role_is_denied_with_owner_named() {
        let ctx = ExecutionContext::with_role("architect");
        let err = assert_capability(Capability::ExecutorLifecycle, &ctx, "task start")
            .expect_err("architect cannot start tasks");
        let msg = err.to_string();
        assert!(msg.contains("'task start' blocked in role 'architect'"));
        assert!(msg.contains("requires the 'executor' role"));
    }
}
