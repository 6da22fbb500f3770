//! Task lifecycle: start (mark in progress) and finish (run validation,
//! record evidence, optionally commit and push).

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::invariants::{LifecycleKey, check_commit_policy, require_keys};
use crate::core::scope::{assert_dirty_files_within_scope, normalize_scope_path, path_within_prefix};
use crate::core::types::{COMMIT_POLICY_PER_TASK, TaskStatus, Verdict, utc_now};
use crate::documents::{CommandEvidence, TaskResult, ValidationEvidence};
use crate::engine::{Engine, StepLog};
use crate::error::LifecycleError;
use crate::io::process::run_shell_command;
use crate::io::session::{Session, TaskHandle, directive_scope_prefixes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStartOutcome {
    pub task: String,
    pub status: TaskStatus,
    pub steps: StepLog,
}

/// Check the task may begin, then mark it `in_progress` when policy allows.
#[instrument(skip_all, fields(session = session_ref, task = task_ref))]
pub fn start(
    engine: &Engine<'_>,
    session_ref: &str,
    task_ref: &str,
    dry_run: bool,
) -> Result<TaskStartOutcome> {
    engine.gate("task start")?;
    let session = engine.session(session_ref)?;
    require_keys(&session.doc.meta, &[LifecycleKey::DirectiveBranch])?;
    let handoff = engine.checked_handoff(&session)?;
    let task = session.resolve_task(task_ref)?;
    let mut doc = task.load()?;
    let branch = session.doc.meta.directive_branch.clone();

    let mut steps = StepLog::new(dry_run);
    if dry_run {
        steps.record(format!("require current branch {branch}"));
        steps.record("require dirty files within directive scope");
        if engine.policy.allow_task_status_updates {
            steps.record(format!("set {} status=in_progress", task.rel));
        }
        steps.record(format!("validate {}", task.rel));
        return Ok(TaskStartOutcome {
            task: task.slug,
            status: doc.meta.status,
            steps,
        });
    }

    engine.require_branch(&branch)?;
    let handoff_allowlist = handoff.map(|h| h.allowlist_paths).unwrap_or_default();
    check_scope(engine, &session, &handoff_allowlist)?;

    if engine.policy.allow_task_status_updates {
        doc.meta.status = TaskStatus::InProgress;
        if engine.policy.allow_task_timestamp_updates {
            doc.meta.updated = utc_now();
        }
        task.save(&doc)?;
        steps.record(format!("set {} status=in_progress", task.rel));
    } else {
        info!("lifecycle policy disallows task status updates; leaving status unchanged");
        steps.record("task status unchanged (policy)");
    }

    engine
        .validator
        .validate(engine.root(), std::slice::from_ref(&task.rel))?;
    steps.record(format!("validated {}", task.rel));
    Ok(TaskStartOutcome {
        task: task.slug,
        status: doc.meta.status,
        steps,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFinishOutcome {
    pub task: String,
    pub verdict: Verdict,
    pub commands: Vec<CommandEvidence>,
    /// Short revision of the per-task commit, if one was made.
    pub commit: Option<String>,
    pub pushed: bool,
    pub steps: StepLog,
}

/// Run the task's validation commands and record the evidence.
///
/// A failing run persists `status=fail` evidence and returns
/// [`LifecycleError::ValidationFailed`]; the task status is left unchanged.
#[instrument(skip_all, fields(session = session_ref, task = task_ref))]
pub fn finish(
    engine: &Engine<'_>,
    session_ref: &str,
    task_ref: &str,
    summary: &str,
    dry_run: bool,
) -> Result<TaskFinishOutcome> {
    engine.gate("task finish")?;
    let session = engine.session(session_ref)?;
    require_keys(
        &session.doc.meta,
        &[LifecycleKey::DirectiveBranch, LifecycleKey::CommitPolicy],
    )?;
    let commit_policy = session.doc.meta.commit_policy.clone();
    check_commit_policy(&commit_policy, &engine.policy.commit_policy_values)?;
    let handoff = engine.checked_handoff(&session)?;
    let task = session.resolve_task(task_ref)?;
    let mut doc = task.load()?;
    let commands = doc.task.validation.commands.clone();
    if commands.is_empty() {
        return Err(LifecycleError::metadata(format!(
            "{} declares no validation commands",
            task.rel
        ))
        .into());
    }
    let branch = session.doc.meta.directive_branch.clone();
    let per_task = commit_policy == COMMIT_POLICY_PER_TASK;

    let mut steps = StepLog::new(dry_run);
    if dry_run {
        steps.record(format!("require current branch {branch}"));
        for command in &commands {
            steps.record(format!("run: {command}"));
        }
        steps.record("require dirty files within directive scope");
        steps.record(format!("record validation evidence in {}", task.rel));
        if per_task {
            steps.record(format!("commit \"{}\"", commit_message(&task)));
        }
        if engine.policy.auto_push {
            steps.record(format!("push {} {branch}", engine.config().remote));
        }
        return Ok(TaskFinishOutcome {
            task: task.slug,
            verdict: Verdict::Pass,
            commands: Vec::new(),
            commit: None,
            pushed: false,
            steps,
        });
    }

    engine.require_branch(&branch)?;
    let evidence = run_validation(engine, &commands, &mut steps);
    let failed = evidence
        .iter()
        .filter(|item| item.status == Verdict::Fail)
        .count();
    let verdict = Verdict::from_success(failed == 0);

    let handoff_allowlist = handoff.map(|h| h.allowlist_paths).unwrap_or_default();
    let changed = check_scope(engine, &session, &handoff_allowlist)?;

    if verdict == Verdict::Pass && !engine.policy.allow_task_status_updates {
        return Err(LifecycleError::policy(
            "lifecycle policy does not allow task status updates; cannot mark task done",
        )
        .into());
    }

    let now = utc_now();
    doc.meta.result = Some(TaskResult {
        summary: summary.to_string(),
        validation: ValidationEvidence {
            status: verdict,
            commands: evidence.clone(),
            changed_files: changed.clone(),
            branch: branch.clone(),
            commit: None,
        },
        updated: now.clone(),
    });
    if verdict == Verdict::Pass {
        doc.meta.status = TaskStatus::Done;
    }
    if engine.policy.allow_task_timestamp_updates {
        doc.meta.updated = now;
    }
    task.save(&doc)?;
    steps.record(format!(
        "recorded validation {} in {}",
        verdict_label(verdict),
        task.rel
    ));

    if verdict == Verdict::Fail {
        return Err(LifecycleError::ValidationFailed {
            task: task.slug,
            failed,
            total: evidence.len(),
        }
        .into());
    }

    let mut outcome = TaskFinishOutcome {
        task: task.slug.clone(),
        verdict,
        commands: evidence,
        commit: None,
        pushed: false,
        steps: StepLog::default(),
    };

    let publish = |steps: &mut StepLog, outcome: &mut TaskFinishOutcome| -> Result<bool> {
        let mut committed = false;
        if per_task {
            let always = engine
                .config()
                .always_allowed_prefixes
                .iter()
                .map(|p| normalize_scope_path(p))
                .collect::<Vec<_>>();
            let mut paths: Vec<String> = changed
                .iter()
                .filter(|file| !always.iter().any(|prefix| path_within_prefix(file, prefix)))
                .cloned()
                .collect();
            if !paths.contains(&task.rel) {
                paths.push(task.rel.clone());
            }
            engine.vcs.stage(&paths)?;
            committed = engine.vcs.commit(&commit_message(&task))?;
            if committed {
                steps.record(format!("commit \"{}\"", commit_message(&task)));
            } else {
                debug!("nothing staged for per-task commit");
            }
        }
        if engine.policy.auto_push {
            let remote = &engine.config().remote;
            let set_upstream = !engine.vcs.has_upstream(&branch)?;
            engine.vcs.push(remote, &branch, set_upstream)?;
            outcome.pushed = true;
            steps.record(format!("push {remote} {branch}"));
        }
        Ok(committed || outcome.pushed)
    };

    match publish(&mut steps, &mut outcome) {
        Ok(true) => {
            let revision = engine.vcs.short_revision()?;
            // Per-task commits leave the tree clean; their revision is reported, not persisted.
            if outcome.pushed && !per_task {
                if let Some(result) = doc.meta.result.as_mut() {
                    result.validation.commit = Some(revision.clone());
                }
                task.save(&doc)?;
                steps.record(format!("recorded revision {revision} in {}", task.rel));
            }
            outcome.commit = Some(revision);
        }
        Ok(false) => {}
        Err(err) => {
            return Err(LifecycleError::Interrupted {
                operation: format!("task finish ({})", task.slug),
                cause: format!("{err:#}"),
                recovery: engine
                    .recovery()
                    .step("git status --short")
                    .step(format!("git log --oneline -1 {branch}"))
                    .step(format!(
                        "git push {} {branch}   # if the commit exists but was not pushed",
                        engine.config().remote
                    ))
                    .artifacts(session.rel.clone()),
            }
            .into());
        }
    }

    info!(task = %outcome.task, commit = ?outcome.commit, "task finished");
    outcome.steps = steps;
    Ok(outcome)
}

fn commit_message(task: &TaskHandle) -> String {
    format!("chore(executor): complete {}", task.slug)
}

/// Run every command; a spawn error or timeout counts as a failed command.
fn run_validation(engine: &Engine<'_>, commands: &[String], steps: &mut StepLog) -> Vec<CommandEvidence> {
    let opts = engine.config().shell_options();
    let mut evidence = Vec::with_capacity(commands.len());
    for command in commands {
        let (status, exit_code) = match run_shell_command(command, engine.root(), &opts) {
            Ok(output) => {
                if output.timed_out {
                    warn!(command = %command, "validation command timed out");
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!(
                    command = %command,
                    "stdout:\n{stdout}{}\nstderr:\n{stderr}{}",
                    output.stdout_truncated_notice("validation"),
                    output.stderr_truncated_notice("validation")
                );
                let exit_code = if output.timed_out {
                    None
                } else {
                    output.status.code()
                };
                (
                    Verdict::from_success(output.status.success() && !output.timed_out),
                    exit_code,
                )
            }
            Err(err) => {
                warn!(command = %command, err = %format!("{err:#}"), "validation command failed to run");
                (Verdict::Fail, None)
            }
        };
        steps.record(format!("{} {command}", verdict_label(status)));
        evidence.push(CommandEvidence {
            command: command.clone(),
            status,
            exit_code,
        });
    }
    evidence
}

fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Pass => "PASS",
        Verdict::Fail => "FAIL",
    }
}

/// Dirty files must sit inside the directive scope; returns the dirty set.
fn check_scope(engine: &Engine<'_>, session: &Session, handoff_allowlist: &[String]) -> Result<Vec<String>> {
    let dirty = engine.vcs.changed_files()?;
    let scan = directive_scope_prefixes(engine.root(), &session.dir)?;
    assert_dirty_files_within_scope(&dirty, &scan.prefixes, &engine.allowlist(handoff_allowlist))?;
    Ok(dirty)
}
