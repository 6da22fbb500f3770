//! Shared state for one lifecycle command invocation.
//!
//! [`Workspace`] is the repository root plus its config; [`Engine`] adds the
//! loaded policy, the acting [`ExecutionContext`], and the two collaborators
//! (version control and metadata validation) behind their traits.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::core::capability::{Capability, ExecutionContext, assert_capability};
use crate::core::invariants::check_handoff;
use crate::documents::Handoff;
use crate::error::{LifecycleError, RecoveryTranscript};
use crate::io::config::{DcConfig, load_config};
use crate::io::git::VcsGateway;
use crate::io::policy::{LifecyclePolicy, load_policy};
use crate::io::session::{Session, resolve_session};
use crate::io::validator::MetadataValidator;

/// Repository root and its configuration.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub config: DcConfig,
}

impl Workspace {
    /// Load `.directive-cli/config.toml` (defaults when missing).
    pub fn load(root: &Path) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            config: load_config(root)?,
        })
    }

    pub fn session(&self, session_ref: &str) -> Result<Session> {
        resolve_session(&self.root, &self.config, session_ref)
    }

    /// Load the lifecycle policy from the configured policy directory.
    pub fn policy(&self) -> Result<LifecyclePolicy> {
        load_policy(&self.config.policy_path(&self.root))
    }
}

/// Everything a directive/task lifecycle command needs.
pub struct Engine<'a> {
    pub workspace: Workspace,
    pub policy: LifecyclePolicy,
    pub ctx: ExecutionContext,
    pub vcs: &'a dyn VcsGateway,
    pub validator: &'a dyn MetadataValidator,
}

impl<'a> Engine<'a> {
    pub fn new(
        workspace: Workspace,
        policy: LifecyclePolicy,
        ctx: ExecutionContext,
        vcs: &'a dyn VcsGateway,
        validator: &'a dyn MetadataValidator,
    ) -> Self {
        Self {
            workspace,
            policy,
            ctx,
            vcs,
            validator,
        }
    }

    pub fn root(&self) -> &Path {
        &self.workspace.root
    }

    pub fn config(&self) -> &DcConfig {
        &self.workspace.config
    }

    /// Role gate for executor lifecycle commands.
    pub fn gate(&self, command: &str) -> Result<()> {
        assert_capability(Capability::ExecutorLifecycle, &self.ctx, command)?;
        Ok(())
    }

    pub fn session(&self, session_ref: &str) -> Result<Session> {
        self.workspace.session(session_ref)
    }

    /// Load the handoff and enforce the mandatory-handoff and branch-match rules.
    pub fn checked_handoff(&self, session: &Session) -> Result<Option<Handoff>> {
        let handoff = session.load_handoff()?;
        check_handoff(
            handoff.as_ref(),
            &session.doc.meta.directive_branch,
            self.policy.require_handoff,
        )?;
        Ok(handoff)
    }

    /// Always-allowed infrastructure prefixes plus `extra`.
    pub fn allowlist(&self, extra: &[String]) -> Vec<String> {
        let mut allowed = self.config().always_allowed_prefixes.clone();
        allowed.extend(extra.iter().cloned());
        allowed
    }

    /// Fail with `BranchMismatch` unless the current branch is `expected`.
    pub fn require_branch(&self, expected: &str) -> Result<String> {
        let current = self.vcs.current_branch()?;
        if current != expected {
            return Err(LifecycleError::BranchMismatch {
                expected: expected.to_string(),
                current,
            }
            .into());
        }
        Ok(current)
    }

    /// Recovery transcript seeded with the current branch (if readable).
    pub fn recovery(&self) -> RecoveryTranscript {
        RecoveryTranscript::new(self.vcs.current_branch().ok())
    }
}

/// Ordered record of lifecycle steps, either applied or (dry-run) planned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepLog {
    dry_run: bool,
    entries: Vec<String>,
}

impl StepLog {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            entries: Vec::new(),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn record(&mut self, step: impl Into<String>) {
        let step = step.into();
        info!(dry_run = self.dry_run, "{step}");
        self.entries.push(step);
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Append another log's entries (runbook composition).
    pub fn extend(&mut self, other: &StepLog) {
        self.entries.extend(other.entries.iter().cloned());
    }
}

impl fmt::Display for StepLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.dry_run { "[dry-run] " } else { "" };
        for (idx, entry) in self.entries.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{prefix}{entry}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_log_marks_dry_run_lines() {
        let mut log = StepLog::new(true);
        log.record("checkout feat/a");
        log.record("validate metadata");
        assert_eq!(
            log.to_string(),
            "[dry-run] checkout feat/a\n[dry-run] validate metadata"
        );

        let mut applied = StepLog::new(false);
        applied.record("checkout feat/a");
        assert_eq!(applied.to_string(), "checkout feat/a");
    }
}
