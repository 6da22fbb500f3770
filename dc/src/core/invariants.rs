//! Cross-document invariants not expressible via JSON Schema.

use crate::core::types::{TaskStatus, Verdict};
use crate::documents::{DirectiveMeta, Handoff, TaskDoc};
use crate::error::LifecycleError;

/// Directive keys a lifecycle command depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKey {
    DirectiveBranch,
    BaseBranch,
    CommitPolicy,
}

impl LifecycleKey {
    fn name(self) -> &'static str {
        match self {
            LifecycleKey::DirectiveBranch => "directive_branch",
            LifecycleKey::BaseBranch => "directive_base_branch",
            LifecycleKey::CommitPolicy => "commit_policy",
        }
    }

    fn value(self, meta: &DirectiveMeta) -> &str {
        match self {
            LifecycleKey::DirectiveBranch => &meta.directive_branch,
            LifecycleKey::BaseBranch => &meta.directive_base_branch,
            LifecycleKey::CommitPolicy => &meta.commit_policy,
        }
    }
}

/// Fail with `MetadataInvalid` naming every listed key that is blank.
pub fn require_keys(meta: &DirectiveMeta, keys: &[LifecycleKey]) -> Result<(), LifecycleError> {
    let missing: Vec<&str> = keys
        .iter()
        .filter(|key| key.value(meta).trim().is_empty())
        .map(|key| key.name())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(LifecycleError::metadata(format!(
        "directive metadata missing required keys: {}",
        missing.join(", ")
    )))
}

/// The commit policy must be one of `legal` (an empty set advertises no restriction).
pub fn check_commit_policy(commit_policy: &str, legal: &[String]) -> Result<(), LifecycleError> {
    if legal.is_empty() || legal.iter().any(|value| value == commit_policy) {
        return Ok(());
    }
    Err(LifecycleError::policy(format!(
        "unsupported commit_policy '{commit_policy}' (lifecycle policy allows: {})",
        legal.join(", ")
    )))
}

/// Bind planning output to execution input.
///
/// When `required` is set a handoff must exist; whenever one exists its
/// `directive_branch` must be present and equal the directive's.
pub fn check_handoff(
    handoff: Option<&Handoff>,
    directive_branch: &str,
    required: bool,
) -> Result<(), LifecycleError> {
    let Some(handoff) = handoff else {
        if required {
            return Err(LifecycleError::policy(
                "executor policy requires a valid <directive_slug>.handoff.json before execution",
            ));
        }
        return Ok(());
    };
    let handoff_branch = handoff.directive_branch.trim();
    if handoff_branch.is_empty() {
        return Err(LifecycleError::policy("handoff is missing directive_branch"));
    }
    if handoff_branch != directive_branch {
        return Err(LifecycleError::policy(format!(
            "handoff branch '{handoff_branch}' does not match directive metadata branch '{directive_branch}'"
        )));
    }
    Ok(())
}

/// A task may close out a directive only when it is done with passing evidence.
pub fn check_task_closed(label: &str, task: &TaskDoc) -> Result<(), LifecycleError> {
    if task.meta.status != TaskStatus::Done {
        return Err(LifecycleError::TaskIncomplete {
            task: label.to_string(),
        });
    }
    let passed = task
        .meta
        .result
        .as_ref()
        .is_some_and(|result| result.validation.status == Verdict::Pass);
    if !passed {
        return Err(LifecycleError::TaskUnvalidated {
            task: label.to_string(),
        });
    }
    Ok(())
}
