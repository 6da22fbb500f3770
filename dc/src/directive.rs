//! Directive lifecycle: start, finish, archive, merge, cleanup.
//!
//! Every command checks its preconditions before touching version control.
//! Failures after a VCS mutation surface as [`LifecycleError::Interrupted`]
//! with a recovery transcript; nothing is rolled back automatically.
//!
//! Dry-run evaluates metadata, policy, handoff, and task preconditions plus
//! read-only ancestry probes, and records the VCS plan without querying or
//! changing working-tree state.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::invariants::{LifecycleKey, check_commit_policy, check_task_closed, require_keys};
use crate::core::scope::{TaskIntersection, assert_dirty_files_within_scope, find_intersections};
use crate::core::types::{
    COMMIT_POLICY_PER_TASK, DirectiveStatus, MergeStatus, slugify, utc_now,
};
use crate::documents::TaskDoc;
use crate::engine::{Engine, StepLog};
use crate::error::LifecycleError;
use crate::io::session::{ScopeScan, directive_scope_prefixes, load_json, scan_task_scopes};

/// How `directive start` treats task scope intersections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapMode {
    /// Log each intersection and continue.
    #[default]
    Warn,
    /// Any intersection is a `ScopeViolation`.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub session: String,
    pub branch: String,
    /// True when the branch was bootstrapped from its base.
    pub created_branch: bool,
    pub intersections: Vec<TaskIntersection>,
    pub skipped_tasks: usize,
    pub steps: StepLog,
}

/// Move the worktree onto the directive branch after checking policy and scope.
#[instrument(skip_all, fields(session = session_ref))]
pub fn start(
    engine: &Engine<'_>,
    session_ref: &str,
    overlap: OverlapMode,
    dry_run: bool,
) -> Result<StartOutcome> {
    engine.gate("directive start")?;
    let session = engine.session(session_ref)?;
    let meta = &session.doc.meta;
    require_keys(
        meta,
        &[
            LifecycleKey::DirectiveBranch,
            LifecycleKey::BaseBranch,
            LifecycleKey::CommitPolicy,
        ],
    )?;
    check_commit_policy(&meta.commit_policy, &engine.policy.commit_policy_values)?;
    let handoff = engine.checked_handoff(&session)?;
    let branch = meta.directive_branch.clone();
    let base = meta.directive_base_branch.clone();
    info!(branch = %branch, base = %base, commit_policy = %meta.commit_policy, "directive start");

    let scan = scan_task_scopes(&session.dir)?;
    if !scan.skipped.is_empty() {
        warn!(skipped = scan.skipped.len(), "task files skipped during scope scan");
    }
    let intersections = find_intersections(&scan.tasks);
    for item in &intersections {
        let marker = if item.linked_by_dependency {
            "linked"
        } else {
            "unlinked"
        };
        let sample = item
            .overlaps
            .first()
            .map(|o| format!("{} :: {}", o.left, o.right))
            .unwrap_or_default();
        warn!("[{marker}] {} <-> {} | {sample}", item.task_a, item.task_b);
    }
    if overlap == OverlapMode::Fail && !intersections.is_empty() {
        return Err(LifecycleError::ScopeViolation(format!(
            "{} task allowlist intersection(s) detected; resolve overlaps or rerun without --strict-overlaps",
            intersections.len()
        ))
        .into());
    }

    let allowlist = engine.allowlist(
        handoff
            .as_ref()
            .map(|h| h.allowlist_paths.as_slice())
            .unwrap_or_default(),
    );
    let mut steps = StepLog::new(dry_run);
    let mut outcome = StartOutcome {
        session: session.name.clone(),
        branch: branch.clone(),
        created_branch: false,
        intersections,
        skipped_tasks: scan.skipped.len(),
        steps: StepLog::default(),
    };

    if dry_run {
        steps.record("require clean working tree (infrastructure and handoff allowlist excepted)");
        steps.record(format!(
            "checkout {branch} (or create it from {base} when policy allows)"
        ));
        steps.record(format!("validate {}", session.meta_rel()));
        outcome.steps = steps;
        return Ok(outcome);
    }

    engine.vcs.ensure_clean_except_prefixes(&allowlist)?;
    steps.record("working tree clean");

    let current = engine.vcs.current_branch()?;
    let mut switched = false;
    if current != branch {
        if engine.vcs.branch_exists_local(&branch)? {
            engine.vcs.checkout(&branch)?;
            steps.record(format!("checkout {branch}"));
        } else if engine.policy.allow_branch_bootstrap {
            if !engine.vcs.branch_exists_local(&base)? {
                return Err(LifecycleError::BranchMissing {
                    branch: base,
                    reason: "local base branch not found; create or switch to it before directive start"
                        .to_string(),
                }
                .into());
            }
            engine.vcs.create_branch(&branch, &base)?;
            outcome.created_branch = true;
            steps.record(format!("create {branch} from {base}"));
        } else {
            return Err(LifecycleError::BranchMissing {
                branch,
                reason: "missing locally and lifecycle policy does not allow bootstrap from base"
                    .to_string(),
            }
            .into());
        }
        switched = true;
    } else {
        steps.record(format!("already on {branch}"));
    }

    if let Err(err) = engine
        .validator
        .validate(engine.root(), &[session.meta_rel()])
    {
        if !switched {
            return Err(err);
        }
        let mut recovery = engine.recovery().step(format!("git checkout {current}"));
        if outcome.created_branch {
            recovery = recovery.step(format!(
                "git branch -D {branch}   # only if branch is unneeded"
            ));
        }
        return Err(LifecycleError::Interrupted {
            operation: "directive start".to_string(),
            cause: format!("{err:#}"),
            recovery: recovery.artifacts(session.rel.clone()),
        }
        .into());
    }
    steps.record(format!("validated {}", session.meta_rel()));
    outcome.steps = steps;
    Ok(outcome)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishOutcome {
    pub session: String,
    /// Dirty files left for a human commit after closeout.
    pub remaining_files: usize,
    pub steps: StepLog,
}

/// Mark a directive done once every task is done with passing evidence.
#[instrument(skip_all, fields(session = session_ref))]
pub fn finish(engine: &Engine<'_>, session_ref: &str, dry_run: bool) -> Result<FinishOutcome> {
    engine.gate("directive finish")?;
    let mut session = engine.session(session_ref)?;
    require_keys(
        &session.doc.meta,
        &[LifecycleKey::DirectiveBranch, LifecycleKey::CommitPolicy],
    )?;
    let commit_policy = session.doc.meta.commit_policy.clone();
    check_commit_policy(&commit_policy, &engine.policy.commit_policy_values)?;
    let handoff = engine.checked_handoff(&session)?;

    let task_files = session.task_files()?;
    if task_files.is_empty() {
        return Err(LifecycleError::metadata(format!(
            "directive {} has no task files to close out",
            session.name
        ))
        .into());
    }
    let mut files = vec![session.meta_rel()];
    for path in &task_files {
        let doc: TaskDoc = load_json(path)?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        check_task_closed(&label, &doc)?;
        files.push(session.rel_path(path));
    }
    info!(tasks = task_files.len(), "all tasks done with passing evidence");

    let branch = session.doc.meta.directive_branch.clone();
    let mut steps = StepLog::new(dry_run);
    if dry_run {
        steps.record(format!("require current branch {branch}"));
        steps.record(format!("validate {} file(s)", files.len()));
        steps.record("require dirty files within directive scope");
        if commit_policy == COMMIT_POLICY_PER_TASK {
            steps.record("require zero pending changes (per_task)");
        }
        steps.record(format!("set {} status=done", session.meta_rel()));
        return Ok(FinishOutcome {
            session: session.name,
            remaining_files: 0,
            steps,
        });
    }

    engine.require_branch(&branch)?;
    engine.validator.validate(engine.root(), &files)?;
    steps.record(format!("validated {} file(s)", files.len()));

    let handoff_allowlist = handoff.map(|h| h.allowlist_paths).unwrap_or_default();
    let allowlist = engine.allowlist(&handoff_allowlist);
    let dirty = engine.vcs.changed_files()?;
    let ScopeScan { prefixes, .. } = directive_scope_prefixes(engine.root(), &session.dir)?;
    assert_dirty_files_within_scope(&dirty, &prefixes, &allowlist)?;
    if commit_policy == COMMIT_POLICY_PER_TASK {
        let pending = pending_files(&dirty, &engine.config().always_allowed_prefixes);
        if !pending.is_empty() {
            return Err(LifecycleError::policy(format!(
                "commit_policy per_task requires zero pending changes before directive finish ({} file(s) dirty)",
                pending.len()
            ))
            .into());
        }
    }

    session.doc.meta.status = DirectiveStatus::Done;
    session.doc.meta.updated = utc_now();
    session.save_meta()?;
    steps.record(format!("set {} status=done", session.meta_rel()));

    let remaining = pending_files(
        &engine.vcs.changed_files()?,
        &engine.config().always_allowed_prefixes,
    )
    .len();
    steps.record(format!("{remaining} file(s) remain for manual commit"));
    Ok(FinishOutcome {
        session: session.name,
        remaining_files: remaining,
        steps,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub session: String,
    pub archive_branch: String,
    pub steps: StepLog,
}

/// Archive branch for a session handle (`chore/archive-<slug>`).
pub fn archive_branch_name(session: &str) -> String {
    let slug = slugify(session);
    if slug.is_empty() {
        return "chore/archive-directive".to_string();
    }
    format!("chore/archive-{slug}")
}

/// Mark a directive archived on a short-lived branch merged into base.
#[instrument(skip_all, fields(session = session_ref))]
pub fn archive(engine: &Engine<'_>, session_ref: &str, dry_run: bool) -> Result<ArchiveOutcome> {
    engine.gate("directive archive")?;
    let mut session = engine.session(session_ref)?;
    if session.doc.meta.status == DirectiveStatus::Archived {
        return Err(LifecycleError::policy(format!(
            "directive is already archived: {}",
            session.name
        ))
        .into());
    }
    require_keys(&session.doc.meta, &[LifecycleKey::BaseBranch])?;
    let base = session.doc.meta.directive_base_branch.clone();
    let archive_branch = archive_branch_name(&session.name);
    let commit_msg = format!("chore(directive): archive {}", session.name);
    let merge_msg = format!("merge: {commit_msg}");

    let mut steps = StepLog::new(dry_run);
    if dry_run {
        steps.record(format!("require current branch {base}"));
        steps.record(format!("allow dirty files only under {}/", session.rel));
        steps.record(format!("checkout -b {archive_branch} {base}"));
        steps.record(format!(
            "set {} status=archived bucket=archived",
            session.meta_rel()
        ));
        steps.record(format!("git add {}", session.rel));
        steps.record(format!("git commit -m \"{commit_msg}\""));
        steps.record(format!("checkout {base}"));
        steps.record(format!("merge --no-ff {archive_branch}"));
        steps.record(format!("branch -D {archive_branch}"));
        return Ok(ArchiveOutcome {
            session: session.name,
            archive_branch,
            steps,
        });
    }

    engine.require_branch(&base)?;
    let always = &engine.config().always_allowed_prefixes;
    let unrelated: Vec<String> = pending_files(&engine.vcs.changed_files()?, always)
        .into_iter()
        .filter(|file| !crate::core::scope::path_within_prefix(file, &session.rel))
        .collect();
    if !unrelated.is_empty() {
        return Err(LifecycleError::DirtyWorkingTree { files: unrelated }.into());
    }
    if engine.vcs.branch_exists_local(&archive_branch)? {
        return Err(LifecycleError::policy(format!(
            "archive branch already exists: {archive_branch}"
        ))
        .into());
    }

    let mut sequence = |steps: &mut StepLog| -> Result<()> {
        engine.vcs.create_branch(&archive_branch, &base)?;
        steps.record(format!("checkout -b {archive_branch} {base}"));
        session.doc.meta.status = DirectiveStatus::Archived;
        session.doc.meta.bucket = "archived".to_string();
        session.doc.meta.updated = utc_now();
        session.save_meta()?;
        steps.record(format!(
            "set {} status=archived bucket=archived",
            session.meta_rel()
        ));
        engine.vcs.stage(std::slice::from_ref(&session.rel))?;
        engine.vcs.commit(&commit_msg)?;
        steps.record(format!("commit \"{commit_msg}\""));
        engine.vcs.checkout(&base)?;
        engine.vcs.merge_no_ff(&archive_branch, &merge_msg)?;
        steps.record(format!("merge --no-ff {archive_branch} into {base}"));
        engine.vcs.delete_branch(&archive_branch, true)?;
        steps.record(format!("delete {archive_branch}"));
        let ending = engine.vcs.current_branch()?;
        if ending != base {
            return Err(LifecycleError::BranchMismatch {
                expected: base.clone(),
                current: ending,
            }
            .into());
        }
        Ok(())
    };

    if let Err(err) = sequence(&mut steps) {
        let mut recovery = engine.recovery().step("git status --short");
        if recovery.current_branch.as_deref() != Some(base.as_str()) {
            recovery = recovery.step(format!("git checkout {base}"));
        }
        let recovery = recovery
            .step(format!(
                "git branch -D {archive_branch}   # only if branch is unneeded"
            ))
            .artifacts(session.rel.clone());
        return Err(LifecycleError::Interrupted {
            operation: format!("directive archive ({})", session.name),
            cause: format!("{err:#}"),
            recovery,
        }
        .into());
    }
    info!(session = %session.name, base = %base, "directive archived");
    Ok(ArchiveOutcome {
        session: session.name,
        archive_branch,
        steps,
    })
}

/// What `directive merge` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    /// Merge status flipped to `merged`.
    Recorded,
    /// Already recorded; nothing changed.
    AlreadyRecorded,
    /// Dry-run: would flip to `merged`.
    WouldRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub session: String,
    pub source_ref: String,
    pub state: MergeState,
    pub steps: StepLog,
}

/// Record `directive_merge_status=merged` once the branch has landed on base.
///
/// Read-only with respect to version control.
#[instrument(skip_all, fields(session = session_ref))]
pub fn merge(engine: &Engine<'_>, session_ref: &str, dry_run: bool) -> Result<MergeOutcome> {
    engine.gate("directive merge")?;
    let mut session = engine.session(session_ref)?;
    require_keys(
        &session.doc.meta,
        &[LifecycleKey::DirectiveBranch, LifecycleKey::BaseBranch],
    )?;
    let branch = session.doc.meta.directive_branch.clone();
    let base = session.doc.meta.directive_base_branch.clone();
    if branch == base {
        return Err(LifecycleError::policy(format!(
            "directive_branch '{branch}' cannot equal base '{base}'"
        ))
        .into());
    }

    let remote = engine.config().remote.clone();
    let source_ref = if engine.vcs.branch_exists_local(&branch)? {
        branch.clone()
    } else if engine.vcs.branch_exists_remote(&remote, &branch)? {
        format!("{remote}/{branch}")
    } else {
        return Err(LifecycleError::BranchMissing {
            branch,
            reason: format!("not found locally or on {remote}"),
        }
        .into());
    };

    if !engine.vcs.is_ancestor(&source_ref, &base)? {
        return Err(LifecycleError::NotMerged {
            branch: source_ref.clone(),
            base: base.clone(),
            guidance: format!(
                "Merge it manually, then re-run directive merge:\n  git checkout {base}\n  git merge --no-ff {source_ref}\n  git push {remote} {base}"
            ),
        }
        .into());
    }

    let mut steps = StepLog::new(dry_run);
    steps.record(format!("{source_ref} is an ancestor of {base}"));
    let state = if session.doc.meta.directive_merge_status == MergeStatus::Merged {
        steps.record("merge status already recorded");
        MergeState::AlreadyRecorded
    } else if dry_run {
        steps.record(format!("set {} directive_merge_status=merged", session.meta_rel()));
        MergeState::WouldRecord
    } else {
        session.doc.meta.directive_merge_status = MergeStatus::Merged;
        session.doc.meta.updated = utc_now();
        session.save_meta()?;
        steps.record(format!("set {} directive_merge_status=merged", session.meta_rel()));
        MergeState::Recorded
    };
    Ok(MergeOutcome {
        session: session.name,
        source_ref,
        state,
        steps,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub session: String,
    pub branch: String,
    /// False when the branch was already gone (or dry-run).
    pub deleted: bool,
    pub steps: StepLog,
}

/// Delete a directive branch that has already landed on its base.
#[instrument(skip_all, fields(session = session_ref))]
pub fn cleanup(engine: &Engine<'_>, session_ref: &str, dry_run: bool) -> Result<CleanupOutcome> {
    engine.gate("directive cleanup")?;
    let session = engine.session(session_ref)?;
    require_keys(
        &session.doc.meta,
        &[LifecycleKey::DirectiveBranch, LifecycleKey::BaseBranch],
    )?;
    let branch = session.doc.meta.directive_branch.clone();
    let base = session.doc.meta.directive_base_branch.clone();
    if branch == base || engine.config().protected_branches.contains(&branch) {
        return Err(LifecycleError::policy(format!(
            "refusing to clean up protected branch '{branch}'"
        ))
        .into());
    }

    let mut steps = StepLog::new(dry_run);
    let mut outcome = CleanupOutcome {
        session: session.name.clone(),
        branch: branch.clone(),
        deleted: false,
        steps: StepLog::default(),
    };
    if !dry_run {
        engine
            .vcs
            .ensure_clean_except_prefixes(&engine.allowlist(&[]))?;
        steps.record("working tree clean");
    } else {
        steps.record("require clean working tree");
    }

    if !engine.vcs.branch_exists_local(&branch)? {
        steps.record(format!("local branch {branch} does not exist; nothing to delete"));
        outcome.steps = steps;
        return Ok(outcome);
    }
    if !engine.vcs.is_ancestor(&branch, &base)? {
        return Err(LifecycleError::NotMerged {
            branch: branch.clone(),
            base: base.clone(),
            guidance: format!(
                "Cleanup blocked. Merge {branch} into {base} first, then run directive merge and cleanup again."
            ),
        }
        .into());
    }

    if dry_run {
        steps.record(format!("checkout {base} if needed"));
        steps.record(format!("branch -d {branch}"));
        outcome.steps = steps;
        return Ok(outcome);
    }

    let current = engine.vcs.current_branch()?;
    let switched = current != base;
    if switched {
        engine.vcs.checkout(&base)?;
        steps.record(format!("checkout {base}"));
    }
    if let Err(err) = engine.vcs.delete_branch(&branch, false) {
        if !switched {
            return Err(err);
        }
        return Err(LifecycleError::Interrupted {
            operation: "directive cleanup".to_string(),
            cause: format!("{err:#}"),
            recovery: engine
                .recovery()
                .step(format!("git branch -d {branch}"))
                .step(format!("git checkout {current}   # to return to the previous branch")),
        }
        .into());
    }
    steps.record(format!("deleted merged branch {branch}"));
    outcome.deleted = true;
    outcome.steps = steps;
    Ok(outcome)
}

/// Print the directive scope and task intersections (read-only).
pub fn scope(engine_root: &std::path::Path, session: &crate::io::session::Session) -> Result<ScopeReport> {
    let scan = directive_scope_prefixes(engine_root, &session.dir)?;
    let tasks = scan_task_scopes(&session.dir)?;
    Ok(ScopeReport {
        session: session.name.clone(),
        prefixes: scan.prefixes,
        skipped: scan.skipped.into_iter().map(|s| s.file).collect(),
        intersections: find_intersections(&tasks.tasks),
    })
}

/// Output of `directive scope`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeReport {
    pub session: String,
    pub prefixes: Vec<String>,
    pub skipped: Vec<String>,
    pub intersections: Vec<TaskIntersection>,
}

/// Dirty files outside the always-allowed infrastructure prefixes.
fn pending_files(dirty: &[String], always_allowed: &[String]) -> Vec<String> {
    dirty
        .iter()
        .filter(|file| {
            !always_allowed
                .iter()
                .map(|prefix| crate::core::scope::normalize_scope_path(prefix))
                .any(|prefix| crate::core::scope::path_within_prefix(file, &prefix))
        })
        .cloned()
        .collect()
}
