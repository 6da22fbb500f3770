//! Named multi-step procedures composed from lifecycle commands.
//!
//! Every non-dry-run invocation must carry the runbook's confirmation token,
//! checked before any step runs. Dry-run flows through every step.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument};

use crate::authoring::{self, NewDirective, NewTask};
use crate::core::capability::{Capability, assert_capability};
use crate::directive::{self, OverlapMode};
use crate::engine::{Engine, StepLog};
use crate::error::LifecycleError;
use crate::io::qa::{QaDecision, QaPrompt};
use crate::task;

/// Printed after the `pre` phase hands control to the implementer.
pub const PAUSE_MARKER: &str =
    "PAUSE_FOR_IMPLEMENTATION: perform coding changes, then run post phase.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunbookName {
    ExecutorTaskCycle,
    ExecutorDirectiveCloseout,
    ExecutorDirectiveCleanup,
    ArchitectAuthoring,
}

impl RunbookName {
    pub fn as_str(self) -> &'static str {
        match self {
            RunbookName::ExecutorTaskCycle => "executor-task-cycle",
            RunbookName::ExecutorDirectiveCloseout => "executor-directive-closeout",
            RunbookName::ExecutorDirectiveCleanup => "executor-directive-cleanup",
            RunbookName::ArchitectAuthoring => "architect-authoring",
        }
    }

    fn capability(self) -> Capability {
        match self {
            RunbookName::ArchitectAuthoring => Capability::ArchitectAuthoring,
            _ => Capability::ExecutorLifecycle,
        }
    }
}

impl fmt::Display for RunbookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunbookName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "executor-task-cycle" => Ok(RunbookName::ExecutorTaskCycle),
            "executor-directive-closeout" => Ok(RunbookName::ExecutorDirectiveCloseout),
            "executor-directive-cleanup" => Ok(RunbookName::ExecutorDirectiveCleanup),
            "architect-authoring" => Ok(RunbookName::ArchitectAuthoring),
            other => Err(anyhow!("unknown runbook '{other}'")),
        }
    }
}

/// Task-cycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Pre,
    Post,
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pre" => Ok(Phase::Pre),
            "post" => Ok(Phase::Post),
            other => Err(anyhow!("unknown phase '{other}' (expected pre or post)")),
        }
    }
}

/// Exact `--confirm` value each procedure demands.
pub fn confirmation_token(name: RunbookName, phase: Phase) -> &'static str {
    match (name, phase) {
        (RunbookName::ExecutorTaskCycle, Phase::Pre) => "executor-task-cycle-pre",
        (RunbookName::ExecutorTaskCycle, Phase::Post) => "executor-task-cycle-post",
        (RunbookName::ExecutorDirectiveCloseout, _) => "executor-directive-closeout",
        (RunbookName::ExecutorDirectiveCleanup, _) => "executor-directive-cleanup",
        (RunbookName::ArchitectAuthoring, _) => "architect-authoring",
    }
}

/// Directive (and optional first task) created by `architect-authoring`.
#[derive(Debug, Clone, Default)]
pub struct AuthoringPlan {
    pub directive: NewDirective,
    pub task: Option<NewTask>,
}

#[derive(Debug, Clone, Default)]
pub struct RunbookRequest {
    pub session: String,
    pub task: Option<String>,
    /// Explicit phase; falls back to the context phase, then `pre`.
    pub phase: Option<Phase>,
    pub summary: Option<String>,
    pub confirm: Option<String>,
    pub dry_run: bool,
    pub strict_overlaps: bool,
    /// Run the QA gate before closeout.
    pub qa_gate: bool,
    /// Pre-supplied QA decision; otherwise the prompt is asked.
    pub qa: Option<QaDecision>,
    pub authoring: AuthoringPlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunbookOutcome {
    pub runbook: RunbookName,
    pub phase: Option<Phase>,
    /// True when the operator must now implement, then run `post`.
    pub paused: bool,
    pub steps: StepLog,
}

/// Execute `name` with the given request.
#[instrument(skip_all, fields(runbook = %name, session = %req.session))]
pub fn run(
    engine: &Engine<'_>,
    name: RunbookName,
    req: &RunbookRequest,
    qa: &dyn QaPrompt,
) -> Result<RunbookOutcome> {
    let phase = match (name, req.phase) {
        (RunbookName::ExecutorTaskCycle, Some(phase)) => Some(phase),
        (RunbookName::ExecutorTaskCycle, None) => Some(match engine.ctx.phase.as_deref() {
            Some(raw) => raw.parse()?,
            None => Phase::Pre,
        }),
        _ => None,
    };
    let token = confirmation_token(name, phase.unwrap_or_default());
    if !req.dry_run && req.confirm.as_deref().map(str::trim) != Some(token) {
        return Err(LifecycleError::ConfirmationRequired {
            runbook: name.to_string(),
            token: token.to_string(),
        }
        .into());
    }
    assert_capability(name.capability(), &engine.ctx, &format!("runbook {name}"))?;
    info!(dry_run = req.dry_run, ?phase, "running runbook");

    let mut steps = StepLog::new(req.dry_run);
    let mut paused = false;
    match (name, phase) {
        (RunbookName::ExecutorTaskCycle, Some(Phase::Post)) => {
            let task_ref = required_task(req)?;
            let summary = req
                .summary
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("post phase requires --summary"))?;
            let out = step("task finish", || {
                task::finish(engine, &req.session, task_ref, summary, req.dry_run)
            })?;
            steps.extend(&out.steps);
        }
        (RunbookName::ExecutorTaskCycle, _) => {
            let task_ref = required_task(req)?;
            let overlap = if req.strict_overlaps {
                OverlapMode::Fail
            } else {
                OverlapMode::Warn
            };
            let started = step("directive start", || {
                directive::start(engine, &req.session, overlap, req.dry_run)
            })?;
            steps.extend(&started.steps);
            let task_started = step("task start", || {
                task::start(engine, &req.session, task_ref, req.dry_run)
            })?;
            steps.extend(&task_started.steps);
            paused = true;
        }
        (RunbookName::ExecutorDirectiveCloseout, _) => {
            closeout(engine, req, qa, &mut steps)?;
        }
        (RunbookName::ExecutorDirectiveCleanup, _) => {
            let out = step("directive cleanup", || {
                directive::cleanup(engine, &req.session, req.dry_run)
            })?;
            steps.extend(&out.steps);
        }
        (RunbookName::ArchitectAuthoring, _) => {
            author(engine, req, &mut steps)?;
        }
    }

    Ok(RunbookOutcome {
        runbook: name,
        phase,
        paused,
        steps,
    })
}

fn closeout(
    engine: &Engine<'_>,
    req: &RunbookRequest,
    qa: &dyn QaPrompt,
    steps: &mut StepLog,
) -> Result<()> {
    if req.qa_gate {
        let decision = match req.qa {
            Some(decision) => Some(decision),
            None if req.dry_run => None,
            None => Some(qa.ask(&req.session)?),
        };
        match decision {
            Some(QaDecision::Fail) => return Err(LifecycleError::QaRejected.into()),
            Some(QaDecision::Pass) => steps.record("QA gate: pass"),
            Some(QaDecision::Skip) => steps.record("QA gate: skipped"),
            None => steps.record("QA gate: prompt operator"),
        }
    }

    let finished = step("directive finish", || {
        directive::finish(engine, &req.session, req.dry_run)
    })?;
    steps.extend(&finished.steps);

    let session = engine.session(&req.session)?;
    let base = session.doc.meta.directive_base_branch.clone();
    if req.dry_run {
        steps.record(format!("checkout {base}"));
    } else if engine.vcs.current_branch()? != base {
        step("checkout base", || engine.vcs.checkout(&base))?;
        steps.record(format!("checkout {base}"));
    }

    let archived = step("directive archive", || {
        directive::archive(engine, &req.session, req.dry_run)
    })?;
    steps.extend(&archived.steps);

    let cleaned = step("directive cleanup", || {
        directive::cleanup(engine, &req.session, req.dry_run)
    })?;
    steps.extend(&cleaned.steps);
    Ok(())
}

fn author(engine: &Engine<'_>, req: &RunbookRequest, steps: &mut StepLog) -> Result<()> {
    let mut draft = req.authoring.directive.clone();
    if draft.session.is_none() && !req.session.trim().is_empty() {
        draft.session = Some(req.session.clone());
    }
    let created = step("directive new", || {
        authoring::new_directive(&engine.workspace, &engine.ctx, &draft, req.dry_run)
    })?;
    steps.extend(&created.steps);

    if let Some(task_draft) = &req.authoring.task {
        let task = step("task new", || {
            authoring::new_task(
                &engine.workspace,
                &engine.ctx,
                &created.session,
                task_draft,
                req.dry_run,
            )
        })?;
        steps.extend(&task.steps);
    }

    match engine.session(&created.session) {
        Ok(session) => {
            let files = session.artifact_files()?;
            step("validate artifacts", || {
                engine.validator.validate(engine.root(), &files)
            })?;
            steps.record(format!("validated {} artifact(s)", files.len()));
        }
        Err(_) if req.dry_run => steps.record(format!("validate artifacts in {}", created.session)),
        Err(err) => return Err(err),
    }
    Ok(())
}

fn required_task(req: &RunbookRequest) -> Result<&str> {
    match req.task.as_deref().map(str::trim) {
        Some(task) if !task.is_empty() => Ok(task),
        _ => bail!("task cycle requires --task"),
    }
}

/// Run one runbook step, naming it in the error chain.
fn step<T>(name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    f().with_context(|| format!("runbook step '{name}' failed"))
}
