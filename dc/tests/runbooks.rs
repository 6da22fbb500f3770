use dc::authoring::{NewDirective, NewTask};
use dc::core::capability::ExecutionContext;
use dc::core::types::{DirectiveStatus, TaskStatus, Verdict};
use dc::documents::{CommandEvidence, TaskDoc, TaskResult, ValidationEvidence};
use dc::engine::Engine;
use dc::error::LifecycleError;
use dc::io::qa::{FixedQa, QaDecision};
use dc::io::session::{load_json, write_json};
use dc::io::validator::SchemaValidator;
use dc::runbook::{self, AuthoringPlan, Phase, RunbookName, RunbookRequest};
use dc::test_support::{AcceptAll, FakeVcs, SessionFixture};

const BRANCH: &str = "feat/vendor-table";
const TASK: &str = "build-table";

fn engine<'a>(fx: &SessionFixture, vcs: &'a FakeVcs, ctx: ExecutionContext) -> Engine<'a> {
    let workspace = fx.workspace().expect("workspace");
    let policy = workspace.policy().expect("policy");
    Engine::new(workspace, policy, ctx, vcs, &AcceptAll)
}

fn fixture() -> SessionFixture {
    let fx = SessionFixture::new("vendor-table").expect("fixture");
    fx.add_task(TASK, &["apps/web/app/vendors"], &["true"])
        .expect("task");
    fx
}

fn request(fx: &SessionFixture, confirm: Option<&str>) -> RunbookRequest {
    RunbookRequest {
        session: fx.session_name().to_string(),
        task: Some(TASK.to_string()),
        confirm: confirm.map(str::to_string),
        ..RunbookRequest::default()
    }
}

fn lifecycle_err(err: &anyhow::Error) -> &LifecycleError {
    err.downcast_ref::<LifecycleError>()
        .unwrap_or_else(|| panic!("not a lifecycle error: {err:#}"))
}

fn task_doc(fx: &SessionFixture) -> TaskDoc {
    load_json(&fx.session_dir().join(format!("{TASK}.task.json"))).expect("load task")
}

fn mark_task_passed(fx: &SessionFixture) {
    let mut doc = task_doc(fx);
    doc.meta.status = TaskStatus::Done;
    doc.meta.result = Some(TaskResult {
        summary: "done".to_string(),
        validation: ValidationEvidence {
            status: Verdict::Pass,
            commands: vec![CommandEvidence {
                command: "true".to_string(),
                status: Verdict::Pass,
                exit_code: Some(0),
            }],
            changed_files: Vec::new(),
            branch: BRANCH.to_string(),
            commit: None,
        },
        updated: "2026-01-15T00:00:00Z".to_string(),
    });
    write_json(&fx.session_dir().join(format!("{TASK}.task.json")), &doc).expect("write");
}

#[test]
fn missing_confirmation_blocks_before_any_step() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, ExecutionContext::default());

    let err = runbook::run(
        &engine,
        RunbookName::ExecutorTaskCycle,
        &request(&fx, Some("yes")),
        &FixedQa(QaDecision::Pass),
    )
    .expect_err("wrong token");
    match lifecycle_err(&err) {
        LifecycleError::ConfirmationRequired { token, .. } => {
            assert_eq!(token, "executor-task-cycle-pre");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(vcs.mutations().is_empty());
    assert_eq!(task_doc(&fx).meta.status, TaskStatus::Todo);
}

#[test]
fn task_cycle_pre_starts_directive_and_task_then_pauses() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, ExecutionContext::default());

    let out = runbook::run(
        &engine,
        RunbookName::ExecutorTaskCycle,
        &request(&fx, Some("executor-task-cycle-pre")),
        &FixedQa(QaDecision::Pass),
    )
    .expect("pre");
    assert!(out.paused);
    assert_eq!(out.phase, Some(Phase::Pre));
    assert_eq!(vcs.current(), BRANCH);
    assert_eq!(task_doc(&fx).meta.status, TaskStatus::InProgress);
}

#[test]
fn task_cycle_phase_comes_from_context() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.set_current(BRANCH);
    let engine = engine(&fx, &vcs, ExecutionContext::new(None, Some("post")));

    let mut req = request(&fx, Some("executor-task-cycle-post"));
    req.summary = Some("table renders".to_string());
    let out = runbook::run(
        &engine,
        RunbookName::ExecutorTaskCycle,
        &req,
        &FixedQa(QaDecision::Pass),
    )
    .expect("post");
    assert!(!out.paused);
    assert_eq!(out.phase, Some(Phase::Post));
    assert_eq!(task_doc(&fx).meta.status, TaskStatus::Done);
}

#[test]
fn task_cycle_post_requires_summary() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, ExecutionContext::default());
    let mut req = request(&fx, Some("executor-task-cycle-post"));
    req.phase = Some(Phase::Post);
    let err = runbook::run(
        &engine,
        RunbookName::ExecutorTaskCycle,
        &req,
        &FixedQa(QaDecision::Pass),
    )
    .expect_err("summary");
    assert!(err.to_string().contains("--summary"));
}

#[test]
fn dry_run_needs_no_confirmation_and_mutates_nothing() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, ExecutionContext::default());
    let mut req = request(&fx, None);
    req.dry_run = true;

    let out = runbook::run(
        &engine,
        RunbookName::ExecutorTaskCycle,
        &req,
        &FixedQa(QaDecision::Pass),
    )
    .expect("dry run");
    assert!(out.steps.dry_run());
    assert!(!out.steps.entries().is_empty());
    assert!(vcs.mutations().is_empty());
    assert_eq!(task_doc(&fx).meta.status, TaskStatus::Todo);
}

#[test]
fn architect_cannot_run_executor_runbooks() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, ExecutionContext::with_role("architect"));
    let err = runbook::run(
        &engine,
        RunbookName::ExecutorDirectiveCleanup,
        &request(&fx, Some("executor-directive-cleanup")),
        &FixedQa(QaDecision::Pass),
    )
    .expect_err("denied");
    assert!(matches!(lifecycle_err(&err), LifecycleError::CapabilityDenied { .. }));
}

#[test]
fn closeout_stops_on_qa_failure() {
    let fx = fixture();
    mark_task_passed(&fx);
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.set_current(BRANCH);
    let engine = engine(&fx, &vcs, ExecutionContext::default());
    let mut req = request(&fx, Some("executor-directive-closeout"));
    req.qa_gate = true;

    let err = runbook::run(
        &engine,
        RunbookName::ExecutorDirectiveCloseout,
        &req,
        &FixedQa(QaDecision::Fail),
    )
    .expect_err("qa fail");
    assert!(matches!(lifecycle_err(&err), LifecycleError::QaRejected));
    assert_eq!(fx.session().expect("session").doc.meta.status, DirectiveStatus::Todo);
    assert!(vcs.mutations().is_empty());
}

#[test]
fn closeout_finishes_archives_and_cleans_up() {
    let fx = fixture();
    mark_task_passed(&fx);
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.land(BRANCH, "dev").expect("land");
    vcs.set_current(BRANCH);
    let engine = engine(&fx, &vcs, ExecutionContext::default());
    let mut req = request(&fx, Some("executor-directive-closeout"));
    req.qa_gate = true;
    req.qa = Some(QaDecision::Pass);

    let out = runbook::run(
        &engine,
        RunbookName::ExecutorDirectiveCloseout,
        &req,
        &FixedQa(QaDecision::Fail),
    )
    .expect("closeout");
    assert_eq!(out.steps.entries()[0], "QA gate: pass");
    assert_eq!(
        fx.session().expect("session").doc.meta.status,
        DirectiveStatus::Archived
    );
    assert_eq!(vcs.current(), "dev");
    assert!(!vcs.has_branch(BRANCH));
    assert!(!vcs.has_branch("chore/archive-26-01-15-vendor-table"));
}

#[test]
fn closeout_step_failure_names_the_step() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.set_current(BRANCH);
    let engine = engine(&fx, &vcs, ExecutionContext::default());

    let err = runbook::run(
        &engine,
        RunbookName::ExecutorDirectiveCloseout,
        &request(&fx, Some("executor-directive-closeout")),
        &FixedQa(QaDecision::Pass),
    )
    .expect_err("task still open");
    assert!(format!("{err:#}").contains("runbook step 'directive finish' failed"));
    assert!(matches!(lifecycle_err(&err), LifecycleError::TaskIncomplete { .. }));
}

#[test]
fn authoring_runbook_creates_valid_directive_and_task() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let validator = SchemaValidator::new().expect("schemas");
    let workspace = fx.workspace().expect("workspace");
    let policy = workspace.policy().expect("policy");
    let engine = Engine::new(
        workspace,
        policy,
        ExecutionContext::with_role("architect"),
        &vcs,
        &validator,
    );
    let req = RunbookRequest {
        session: "26-03-01_reports".to_string(),
        confirm: Some("architect-authoring".to_string()),
        authoring: AuthoringPlan {
            directive: NewDirective {
                title: "Reports".to_string(),
                ..NewDirective::default()
            },
            task: Some(NewTask {
                title: "Export CSV".to_string(),
                allowed_files: vec!["apps/web/app/reports".to_string()],
                validation_commands: vec!["pnpm test".to_string()],
                ..NewTask::default()
            }),
        },
        ..RunbookRequest::default()
    };

    let out = runbook::run(
        &engine,
        RunbookName::ArchitectAuthoring,
        &req,
        &FixedQa(QaDecision::Pass),
    )
    .expect("author");
    assert!(
        out.steps
            .entries()
            .iter()
            .any(|s| s == "validated 2 artifact(s)")
    );
    let session = engine.session("26-03-01_reports").expect("session");
    assert_eq!(session.doc.meta.directive_slug, "reports");
    assert_eq!(session.task_files().expect("tasks").len(), 1);
    assert!(vcs.mutations().is_empty());
}

#[test]
fn executor_cannot_run_authoring_runbook() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, ExecutionContext::with_role("executor"));
    let req = RunbookRequest {
        session: "26-03-01_reports".to_string(),
        confirm: Some("architect-authoring".to_string()),
        authoring: AuthoringPlan {
            directive: NewDirective {
                title: "Reports".to_string(),
                ..NewDirective::default()
            },
            task: None,
        },
        ..RunbookRequest::default()
    };
    let err = runbook::run(
        &engine,
        RunbookName::ArchitectAuthoring,
        &req,
        &FixedQa(QaDecision::Pass),
    )
    .expect_err("denied");
    assert!(matches!(lifecycle_err(&err), LifecycleError::CapabilityDenied { .. }));
}
