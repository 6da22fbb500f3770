//! Lifecycle error taxonomy.
//!
//! Lifecycle functions return `anyhow::Result`; the variants below are raised
//! through it so callers can `downcast_ref::<LifecycleError>()` to classify a
//! failure.

use std::fmt;

use thiserror::Error;

/// Failures signaled by lifecycle commands, gates, and runbooks.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Dirty files outside the declared scope, or conflicting task scopes.
    #[error("scope violation: {0}")]
    ScopeViolation(String),

    /// Working tree has changes outside the allowed prefixes.
    #[error("working tree not clean (disallowed changes):\n{}", bullet_list(.files))]
    DirtyWorkingTree { files: Vec<String> },

    #[error("current branch '{current}' does not match expected branch '{expected}'")]
    BranchMismatch { expected: String, current: String },

    #[error("branch '{branch}' missing: {reason}")]
    BranchMissing { branch: String, reason: String },

    #[error("task not completed: {task}")]
    TaskIncomplete { task: String },

    #[error("task missing passing validation evidence: {task}")]
    TaskUnvalidated { task: String },

    #[error("validation failed for {task}: {failed} of {total} command(s) failed (result recorded with status=fail)")]
    ValidationFailed {
        task: String,
        failed: usize,
        total: usize,
    },

    #[error(
        "'{command}' blocked in role '{role}'; it requires the '{owner}' role. Switch roles or use {owner} commands."
    )]
    CapabilityDenied {
        command: String,
        role: String,
        owner: String,
    },

    /// Unsupported commit policy, missing handoff, handoff branch mismatch.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Missing required keys, malformed JSON, ambiguous or missing singleton files.
    #[error("invalid metadata: {0}")]
    MetadataInvalid(String),

    /// A branch is not an ancestor of its base.
    #[error("branch '{branch}' is not merged into '{base}'.\n{guidance}")]
    NotMerged {
        branch: String,
        base: String,
        guidance: String,
    },

    #[error("runbook '{runbook}' requires --confirm {token} for non-dry-run execution")]
    ConfirmationRequired { runbook: String, token: String },

    #[error("QA gate failed; closeout aborted")]
    QaRejected,

    /// A step failed after version control state had already been mutated.
    #[error("{operation} failed: {cause}\n{recovery}")]
    Interrupted {
        operation: String,
        cause: String,
        recovery: RecoveryTranscript,
    },
}

impl LifecycleError {
    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyViolation(message.into())
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::MetadataInvalid(message.into())
    }
}

/// Operator-facing recovery steps printed after a partially applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoveryTranscript {
    pub current_branch: Option<String>,
    pub steps: Vec<String>,
    /// On-disk location of artifacts that were not merged anywhere yet.
    pub artifacts: Option<String>,
}

impl RecoveryTranscript {
    pub fn new(current_branch: Option<String>) -> Self {
        Self {
            current_branch,
            ..Self::default()
        }
    }

    pub fn step(mut self, command: impl Into<String>) -> Self {
        self.steps.push(command.into());
        self
    }

    pub fn artifacts(mut self, location: impl Into<String>) -> Self {
        self.artifacts = Some(location.into());
        self
    }
}

impl fmt::Display for RecoveryTranscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.current_branch {
            Some(branch) => writeln!(f, "Current branch: {branch}")?,
            None => writeln!(f, "Current branch: <unknown>")?,
        }
        writeln!(f, "Recovery steps:")?;
        for step in &self.steps {
            writeln!(f, "  {step}")?;
        }
        if let Some(location) = &self.artifacts {
            write!(f, "  # Directive files remain at: {location}")?;
        }
        Ok(())
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("  - {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}
