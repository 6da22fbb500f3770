//! `dc`: directive and task lifecycle CLI.
//!
//! Moves directive sessions (`<directives_root>/<session>/`) and their tasks
//! through start, finish, archive, merge, and cleanup on dedicated git
//! branches, and composes those steps into confirmable runbooks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dc::authoring::{self, NewDirective, NewTask};
use dc::core::capability::ExecutionContext;
use dc::directive::{self, OverlapMode};
use dc::engine::{Engine, Workspace};
use dc::exit_codes;
use dc::io::config::DcConfig;
use dc::io::git::Git;
use dc::io::policy::LifecyclePolicy;
use dc::io::qa::{QaDecision, TerminalQa};
use dc::io::validator::{CommandValidator, MetadataValidator, SchemaValidator};
use dc::runbook::{self, AuthoringPlan, PAUSE_MARKER, Phase, RunbookName, RunbookRequest};
use dc::task;

#[derive(Parser)]
#[command(name = "dc", version, about = "Directive and task lifecycle engine")]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Directive lifecycle commands.
    #[command(subcommand)]
    Directive(DirectiveCommand),
    /// Task lifecycle commands.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Run a named multi-step procedure.
    Runbook(RunbookArgs),
    /// Strictly validate session documents.
    Validate {
        /// Repo-relative document path (repeatable).
        #[arg(long = "file", required = true)]
        files: Vec<String>,
    },
    /// Policy file commands.
    #[command(subcommand)]
    Policy(PolicyCommand),
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// Session directory name or directive id.
    #[arg(long)]
    session: String,
    /// Print planned steps without changing anything.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum DirectiveCommand {
    /// Switch to (or create) the directive branch after policy and scope checks.
    Start {
        #[command(flatten)]
        args: SessionArgs,
        /// Fail on task scope intersections instead of warning.
        #[arg(long)]
        strict_overlaps: bool,
    },
    /// Mark the directive done once every task passed validation.
    Finish(SessionArgs),
    /// Mark the directive archived via a short-lived branch merged into base.
    Archive(SessionArgs),
    /// Record the merge once the branch is an ancestor of base.
    Merge(SessionArgs),
    /// Delete the merged directive branch.
    Cleanup(SessionArgs),
    /// Print directive scope prefixes and task intersections as JSON.
    Scope {
        #[arg(long)]
        session: String,
    },
    /// Scaffold a new directive session.
    New(NewDirectiveArgs),
}

#[derive(Args, Debug, Clone)]
struct NewDirectiveArgs {
    #[arg(long)]
    title: String,
    /// Session directory name (default `yy-mm-dd_<slug>`).
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    summary: Option<String>,
    #[arg(long)]
    slug: Option<String>,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    base: Option<String>,
    #[arg(long)]
    commit_policy: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Mark a task in progress.
    Start {
        #[command(flatten)]
        args: SessionArgs,
        /// Task slug or `<slug>.task.json`.
        #[arg(long)]
        task: String,
    },
    /// Run validation commands and record evidence.
    Finish {
        #[command(flatten)]
        args: SessionArgs,
        #[arg(long)]
        task: String,
        /// Summary stored with the validation result.
        #[arg(long, default_value = "")]
        summary: String,
    },
    /// Scaffold a new task in a session.
    New(NewTaskArgs),
}

#[derive(Args, Debug, Clone)]
struct NewTaskArgs {
    #[arg(long)]
    session: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    summary: Option<String>,
    #[arg(long)]
    slug: Option<String>,
    /// Allowed path prefix (repeatable).
    #[arg(long = "allowed")]
    allowed: Vec<String>,
    /// Validation command (repeatable).
    #[arg(long = "validate")]
    validate: Vec<String>,
    #[arg(long = "depends-on")]
    depends_on: Vec<String>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Load and check the required policy files.
    Validate,
}

#[derive(Args, Debug, Clone)]
struct RunbookArgs {
    /// executor-task-cycle, executor-directive-closeout,
    /// executor-directive-cleanup, or architect-authoring.
    name: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long)]
    task: Option<String>,
    /// Task-cycle phase: pre or post (default: DC_PHASE, then pre).
    #[arg(long)]
    phase: Option<String>,
    #[arg(long)]
    summary: Option<String>,
    /// Procedure-specific confirmation token.
    #[arg(long)]
    confirm: Option<String>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    strict_overlaps: bool,
    /// Ask for manual QA before closeout.
    #[arg(long)]
    qa_gate: bool,
    /// QA decision: pass, fail, or skip.
    #[arg(long)]
    qa: Option<String>,
    /// architect-authoring: directive title.
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    directive_summary: Option<String>,
    #[arg(long)]
    slug: Option<String>,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    base: Option<String>,
    #[arg(long)]
    commit_policy: Option<String>,
    /// architect-authoring: also create a task with this title.
    #[arg(long)]
    task_title: Option<String>,
    #[arg(long)]
    task_summary: Option<String>,
    #[arg(long)]
    task_slug: Option<String>,
    #[arg(long = "task-allowed")]
    task_allowed: Vec<String>,
    #[arg(long = "task-validate")]
    task_validate: Vec<String>,
}

fn main() {
    dc::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::FAILED);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let workspace = Workspace::load(&root)?;
    let ctx = ExecutionContext::from_env();
    match cli.command {
        Command::Directive(cmd) => cmd_directive(workspace, ctx, cmd),
        Command::Task(cmd) => cmd_task(workspace, ctx, cmd),
        Command::Runbook(args) => with_engine(workspace, ctx, |engine| cmd_runbook(engine, args)),
        Command::Validate { files } => {
            let validator = build_validator(&workspace.config)?;
            validator.validate(&workspace.root, &files)?;
            println!("metadata valid: {} file(s)", files.len());
            Ok(())
        }
        Command::Policy(PolicyCommand::Validate) => {
            let policy = workspace.policy()?;
            println!("{}", policy_summary(&policy));
            Ok(())
        }
    }
}

fn policy_summary(policy: &LifecyclePolicy) -> String {
    let flag = |on: bool| if on { "on" } else { "off" };
    let commit_policies = if policy.commit_policy_values.is_empty() {
        "any".to_string()
    } else {
        policy.commit_policy_values.join(", ")
    };
    format!(
        "policy valid: commit policies [{commit_policies}], handoff required {}, branch bootstrap {}, task status updates {}, timestamp updates {}, auto-push {}",
        flag(policy.require_handoff),
        flag(policy.allow_branch_bootstrap),
        flag(policy.allow_task_status_updates),
        flag(policy.allow_task_timestamp_updates),
        flag(policy.auto_push),
    )
}

/// Build the engine collaborators (git, validator, policy) and run `f`.
fn with_engine(
    workspace: Workspace,
    ctx: ExecutionContext,
    f: impl FnOnce(&Engine<'_>) -> Result<()>,
) -> Result<()> {
    let policy = workspace.policy()?;
    let git = Git::new(&workspace.root);
    let validator = build_validator(&workspace.config)?;
    let engine = Engine::new(workspace, policy, ctx, &git, validator.as_ref());
    f(&engine)
}

fn build_validator(config: &DcConfig) -> Result<Box<dyn MetadataValidator>> {
    if config.validator.command.is_empty() {
        return Ok(Box::new(SchemaValidator::new()?));
    }
    Ok(Box::new(CommandValidator::new(
        config.validator.command.clone(),
        Duration::from_secs(config.validation.timeout_secs),
        config.validation.output_limit_bytes,
    )))
}

fn cmd_directive(workspace: Workspace, ctx: ExecutionContext, cmd: DirectiveCommand) -> Result<()> {
    match cmd {
        DirectiveCommand::Start {
            args,
            strict_overlaps,
        } => with_engine(workspace, ctx, |engine| {
            let overlap = if strict_overlaps {
                OverlapMode::Fail
            } else {
                OverlapMode::Warn
            };
            let out = directive::start(engine, &args.session, overlap, args.dry_run)?;
            println!("{}", out.steps);
            if !out.intersections.is_empty() {
                println!("task scope intersections: {}", out.intersections.len());
            }
            if out.skipped_tasks > 0 {
                println!("task files skipped: {}", out.skipped_tasks);
            }
            Ok(())
        }),
        DirectiveCommand::Finish(args) => with_engine(workspace, ctx, |engine| {
            let out = directive::finish(engine, &args.session, args.dry_run)?;
            println!("{}", out.steps);
            Ok(())
        }),
        DirectiveCommand::Archive(args) => with_engine(workspace, ctx, |engine| {
            let out = directive::archive(engine, &args.session, args.dry_run)?;
            println!("{}", out.steps);
            Ok(())
        }),
        DirectiveCommand::Merge(args) => with_engine(workspace, ctx, |engine| {
            let out = directive::merge(engine, &args.session, args.dry_run)?;
            println!("{}", out.steps);
            Ok(())
        }),
        DirectiveCommand::Cleanup(args) => with_engine(workspace, ctx, |engine| {
            let out = directive::cleanup(engine, &args.session, args.dry_run)?;
            println!("{}", out.steps);
            Ok(())
        }),
        DirectiveCommand::Scope { session } => cmd_directive_scope(&workspace, &session),
        DirectiveCommand::New(args) => cmd_directive_new(&workspace, &ctx, args),
    }
}

fn cmd_directive_scope(workspace: &Workspace, session: &str) -> Result<()> {
    let session = workspace.session(session)?;
    let report = directive::scope(&workspace.root, &session)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize scope report")?
    );
    Ok(())
}

fn cmd_directive_new(
    workspace: &Workspace,
    ctx: &ExecutionContext,
    args: NewDirectiveArgs,
) -> Result<()> {
    let draft = NewDirective {
        title: args.title,
        summary: args.summary,
        slug: args.slug,
        session: args.session,
        branch: args.branch,
        base: args.base,
        commit_policy: args.commit_policy,
    };
    let created = authoring::new_directive(workspace, ctx, &draft, args.dry_run)?;
    println!("{}", created.steps);
    println!("session: {}", created.session);
    Ok(())
}

fn cmd_task(workspace: Workspace, ctx: ExecutionContext, cmd: TaskCommand) -> Result<()> {
    match cmd {
        TaskCommand::Start { args, task } => with_engine(workspace, ctx, |engine| {
            let out = task::start(engine, &args.session, &task, args.dry_run)?;
            println!("{}", out.steps);
            Ok(())
        }),
        TaskCommand::Finish {
            args,
            task,
            summary,
        } => with_engine(workspace, ctx, |engine| {
            let out = task::finish(engine, &args.session, &task, &summary, args.dry_run)?;
            println!("{}", out.steps);
            if let Some(commit) = out.commit {
                println!("commit: {commit}");
            }
            Ok(())
        }),
        TaskCommand::New(args) => cmd_task_new(&workspace, &ctx, args),
    }
}

fn cmd_task_new(workspace: &Workspace, ctx: &ExecutionContext, args: NewTaskArgs) -> Result<()> {
    let draft = NewTask {
        title: args.title,
        summary: args.summary,
        slug: args.slug,
        allowed_files: args.allowed,
        validation_commands: args.validate,
        depends_on: args.depends_on,
    };
    let created = authoring::new_task(workspace, ctx, &args.session, &draft, args.dry_run)?;
    println!("{}", created.steps);
    Ok(())
}

fn cmd_runbook(engine: &Engine<'_>, args: RunbookArgs) -> Result<()> {
    let name: RunbookName = args.name.parse()?;
    let phase = args.phase.as_deref().map(str::parse::<Phase>).transpose()?;
    let qa = args.qa.as_deref().map(str::parse::<QaDecision>).transpose()?;
    let task_plan = args.task_title.map(|title| NewTask {
        title,
        summary: args.task_summary,
        slug: args.task_slug,
        allowed_files: args.task_allowed,
        validation_commands: args.task_validate,
        depends_on: Vec::new(),
    });
    let req = RunbookRequest {
        session: args.session,
        task: args.task,
        phase,
        summary: args.summary,
        confirm: args.confirm,
        dry_run: args.dry_run,
        strict_overlaps: args.strict_overlaps,
        qa_gate: args.qa_gate,
        qa,
        authoring: AuthoringPlan {
            directive: NewDirective {
                title: args.title.unwrap_or_default(),
                summary: args.directive_summary,
                slug: args.slug,
                session: None,
                branch: args.branch,
                base: args.base,
                commit_policy: args.commit_policy,
            },
            task: task_plan,
        },
    };
    let out = runbook::run(engine, name, &req, &TerminalQa)?;
    println!("{}", out.steps);
    if out.paused {
        println!("{PAUSE_MARKER}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_directive_start_with_strict_overlaps() {
        let cli = Cli::parse_from([
            "dc",
            "directive",
            "start",
            "--session",
            "26-01-15_vendor-table",
            "--strict-overlaps",
            "--dry-run",
        ]);
        match cli.command {
            Command::Directive(DirectiveCommand::Start {
                args,
                strict_overlaps,
            }) => {
                assert_eq!(args.session, "26-01-15_vendor-table");
                assert!(args.dry_run);
                assert!(strict_overlaps);
            }
            _ => panic!("expected directive start"),
        }
    }

    #[test]
    fn parse_task_finish_with_summary_and_root() {
        let cli = Cli::parse_from([
            "dc",
            "--root",
            "/tmp/repo",
            "task",
            "finish",
            "--session",
            "s1",
            "--task",
            "build-table",
            "--summary",
            "table done",
        ]);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/repo")));
        match cli.command {
            Command::Task(TaskCommand::Finish {
                args,
                task,
                summary,
            }) => {
                assert_eq!(args.session, "s1");
                assert!(!args.dry_run);
                assert_eq!(task, "build-table");
                assert_eq!(summary, "table done");
            }
            _ => panic!("expected task finish"),
        }
    }

    #[test]
    fn parse_runbook_with_confirm_and_phase() {
        let cli = Cli::parse_from([
            "dc",
            "runbook",
            "executor-task-cycle",
            "--session",
            "s1",
            "--task",
            "a",
            "--phase",
            "post",
            "--confirm",
            "executor-task-cycle-post",
            "--summary",
            "done",
        ]);
        match cli.command {
            Command::Runbook(args) => {
                assert_eq!(args.name, "executor-task-cycle");
                assert_eq!(args.phase.as_deref(), Some("post"));
                assert_eq!(args.confirm.as_deref(), Some("executor-task-cycle-post"));
            }
            _ => panic!("expected runbook"),
        }
    }

    #[test]
    fn parse_task_new_repeatable_flags() {
        let cli = Cli::parse_from([
            "dc", "task", "new", "--session", "s1", "--title", "Build", "--allowed", "src",
            "--allowed", "docs", "--validate", "true",
        ]);
        match cli.command {
            Command::Task(TaskCommand::New(args)) => {
                assert_eq!(args.allowed, vec!["src", "docs"]);
                assert_eq!(args.validate, vec!["true"]);
            }
            _ => panic!("expected task new"),
        }
    }

    #[test]
    fn validate_requires_file() {
        assert!(Cli::try_parse_from(["dc", "validate"]).is_err());
    }

    #[test]
    fn policy_summary_lists_flags() {
        let summary = policy_summary(&LifecyclePolicy {
            auto_push: true,
            ..LifecyclePolicy::default()
        });
        assert_eq!(
            summary,
            "policy valid: commit policies [per_task, end_of_directive], handoff required off, \
             branch bootstrap on, task status updates on, timestamp updates on, auto-push on"
        );
    }
}
