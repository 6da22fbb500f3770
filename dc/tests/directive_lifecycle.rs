//! Directive lifecycle against the in-memory VCS.
//!
//! Every failing precondition must leave version control untouched, which
//! the fake's mutation log makes observable.

use dc::core::capability::ExecutionContext;
use dc::core::types::{DirectiveStatus, MergeStatus, TaskStatus, Verdict};
use dc::directive::{self, MergeState, OverlapMode};
use dc::documents::{CommandEvidence, TaskDoc, TaskResult, ValidationEvidence};
use dc::engine::Engine;
use dc::error::LifecycleError;
use dc::io::git::VcsGateway;
use dc::io::policy::LifecyclePolicy;
use dc::io::session::{load_json, write_json};
use dc::io::validator::MetadataValidator;
use dc::test_support::{AcceptAll, FakeVcs, RejectAll, SessionFixture};

const BRANCH: &str = "feat/vendor-table";

fn engine<'a>(
    fx: &SessionFixture,
    vcs: &'a dyn VcsGateway,
    validator: &'a dyn MetadataValidator,
    ctx: ExecutionContext,
) -> Engine<'a> {
    let workspace = fx.workspace().expect("workspace");
    let policy = workspace.policy().expect("policy");
    Engine::new(workspace, policy, ctx, vcs, validator)
}

fn fixture() -> SessionFixture {
    let fx = SessionFixture::new("vendor-table").expect("fixture");
    fx.add_task("build-table", &["apps/web/app/vendors"], &["true"])
        .expect("task");
    fx
}

fn lifecycle_err(err: &anyhow::Error) -> &LifecycleError {
    err.downcast_ref::<LifecycleError>()
        .unwrap_or_else(|| panic!("not a lifecycle error: {err:#}"))
}

fn close_task(fx: &SessionFixture, slug: &str) {
    let path = fx.session_dir().join(format!("{slug}.task.json"));
    let mut doc: TaskDoc = load_json(&path).expect("load task");
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
    write_json(&path, &doc).expect("write task");
}

#[test]
fn start_bootstraps_missing_branch_from_base() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let out = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false).expect("start");
    assert!(out.created_branch);
    assert_eq!(vcs.current(), BRANCH);
    assert_eq!(vcs.mutations(), vec![format!("create_branch {BRANCH} dev")]);
}

#[test]
fn start_rerun_checks_out_existing_branch() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let out = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false).expect("start");
    assert!(!out.created_branch);
    assert_eq!(vcs.mutations(), vec![format!("checkout {BRANCH}")]);

    let again = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false).expect("rerun");
    assert!(!again.created_branch);
    assert_eq!(vcs.mutations().len(), 1);
}

#[test]
fn start_without_bootstrap_policy_requires_branch() {
    let fx = fixture();
    fx.write_policies(&LifecyclePolicy {
        allow_branch_bootstrap: false,
        ..LifecyclePolicy::default()
    })
    .expect("policies");
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false)
        .expect_err("missing branch");
    assert!(matches!(lifecycle_err(&err), LifecycleError::BranchMissing { .. }));
    assert!(vcs.mutations().is_empty());
}

#[test]
fn start_rejects_dirty_tree_unless_allowlisted() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.set_dirty(&["pnpm-lock.yaml", ".runbook/session-logs/today.log"]);
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false)
        .expect_err("dirty");
    match lifecycle_err(&err) {
        LifecycleError::DirtyWorkingTree { files } => {
            assert_eq!(files, &vec!["pnpm-lock.yaml".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(vcs.mutations().is_empty());

    fx.add_handoff(BRANCH, &["pnpm-lock.yaml"]).expect("handoff");
    directive::start(&engine, fx.session_name(), OverlapMode::Warn, false)
        .expect("handoff allowlist admits lockfile");
}

#[test]
fn start_enforces_handoff_rules() {
    let fx = fixture();
    fx.write_policies(&LifecyclePolicy {
        require_handoff: true,
        ..LifecyclePolicy::default()
    })
    .expect("policies");
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false)
        .expect_err("handoff required");
    assert!(matches!(lifecycle_err(&err), LifecycleError::PolicyViolation(_)));

    fx.add_handoff("feat/other", &[]).expect("handoff");
    let err = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false)
        .expect_err("branch mismatch");
    assert!(err.to_string().contains("does not match directive metadata branch"));
    assert!(vcs.mutations().is_empty());
}

#[test]
fn start_rejects_unsupported_commit_policy() {
    let fx = fixture();
    fx.edit_meta(|meta| meta.commit_policy = "whenever".to_string())
        .expect("edit");
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let err = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false)
        .expect_err("policy");
    assert!(matches!(lifecycle_err(&err), LifecycleError::PolicyViolation(_)));
}

#[test]
fn strict_overlaps_fail_before_any_mutation() {
    let fx = fixture();
    fx.add_task("app-shell", &["apps/web/app"], &["true"])
        .expect("task");
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let warned = directive::start(&engine, fx.session_name(), OverlapMode::Warn, true)
        .expect("warn mode");
    assert_eq!(warned.intersections.len(), 1);
    assert!(!warned.intersections[0].linked_by_dependency);

    let err = directive::start(&engine, fx.session_name(), OverlapMode::Fail, false)
        .expect_err("strict");
    assert!(matches!(lifecycle_err(&err), LifecycleError::ScopeViolation(_)));
    assert!(vcs.mutations().is_empty());
}

#[test]
fn architect_role_cannot_run_executor_commands() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::with_role("architect"));
    let err = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false)
        .expect_err("denied");
    match lifecycle_err(&err) {
        LifecycleError::CapabilityDenied { command, owner, .. } => {
            assert_eq!(command, "directive start");
            assert_eq!(owner, "executor");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn start_validation_failure_after_branch_switch_reports_recovery() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &RejectAll, ExecutionContext::default());

    let err = directive::start(&engine, fx.session_name(), OverlapMode::Warn, false)
        .expect_err("invalid metadata");
    assert!(matches!(lifecycle_err(&err), LifecycleError::Interrupted { .. }));
    let text = err.to_string();
    assert!(text.contains("git checkout dev"), "{text}");
    assert!(text.contains(&format!("git branch -D {BRANCH}")), "{text}");
}

#[test]
fn start_dry_run_plans_without_mutation() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.set_dirty(&["notes.txt"]);
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let out = directive::start(&engine, fx.session_name(), OverlapMode::Warn, true).expect("plan");
    assert!(out.steps.dry_run());
    assert!(out.steps.to_string().starts_with("[dry-run] "));
    assert!(vcs.mutations().is_empty());
}

#[test]
fn finish_requires_closed_tasks_and_branch() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::finish(&engine, fx.session_name(), false).expect_err("open task");
    assert!(matches!(lifecycle_err(&err), LifecycleError::TaskIncomplete { .. }));

    close_task(&fx, "build-table");
    let err = directive::finish(&engine, fx.session_name(), false).expect_err("wrong branch");
    assert!(matches!(lifecycle_err(&err), LifecycleError::BranchMismatch { .. }));

    vcs.set_current(BRANCH);
    vcs.set_dirty(&["apps/web/app/vendors/page.tsx"]);
    let out = directive::finish(&engine, fx.session_name(), false).expect("finish");
    assert_eq!(out.remaining_files, 1);
    assert_eq!(fx.session().expect("session").doc.meta.status, DirectiveStatus::Done);
    assert!(vcs.mutations().is_empty());
}

#[test]
fn finish_rejects_done_task_without_passing_evidence() {
    let fx = fixture();
    let path = fx.session_dir().join("build-table.task.json");
    let mut doc: TaskDoc = load_json(&path).expect("load");
    doc.meta.status = TaskStatus::Done;
    write_json(&path, &doc).expect("write");
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let err = directive::finish(&engine, fx.session_name(), false).expect_err("unvalidated");
    assert!(matches!(lifecycle_err(&err), LifecycleError::TaskUnvalidated { .. }));
}

#[test]
fn finish_without_tasks_is_invalid() {
    let fx = SessionFixture::new("empty").expect("fixture");
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let err = directive::finish(&engine, fx.session_name(), false).expect_err("no tasks");
    assert!(matches!(lifecycle_err(&err), LifecycleError::MetadataInvalid(_)));
}

#[test]
fn finish_per_task_requires_no_pending_changes() {
    let fx = fixture();
    fx.edit_meta(|meta| meta.commit_policy = "per_task".to_string())
        .expect("edit");
    close_task(&fx, "build-table");
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.set_current(BRANCH);
    vcs.set_dirty(&["apps/web/app/vendors/page.tsx", ".turbo/cache.json"]);
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::finish(&engine, fx.session_name(), false).expect_err("pending");
    assert!(matches!(lifecycle_err(&err), LifecycleError::PolicyViolation(_)));

    vcs.set_dirty(&[".turbo/cache.json"]);
    directive::finish(&engine, fx.session_name(), false).expect("infra only");
}

#[test]
fn finish_rejects_out_of_scope_changes() {
    let fx = fixture();
    close_task(&fx, "build-table");
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.set_current(BRANCH);
    vcs.set_dirty(&["README.md"]);
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let err = directive::finish(&engine, fx.session_name(), false).expect_err("scope");
    assert!(matches!(lifecycle_err(&err), LifecycleError::ScopeViolation(_)));
    assert_eq!(fx.session().expect("session").doc.meta.status, DirectiveStatus::Todo);
}

#[test]
fn archive_of_archived_directive_fails_without_vcs_mutation() {
    let fx = fixture();
    fx.edit_meta(|meta| meta.status = DirectiveStatus::Archived)
        .expect("edit");
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::archive(&engine, fx.session_name(), false).expect_err("archived");
    assert!(matches!(lifecycle_err(&err), LifecycleError::PolicyViolation(_)));
    assert!(vcs.mutations().is_empty());
}

#[test]
fn archive_commits_on_short_lived_branch_and_merges() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let meta_rel = fx.session().expect("session").meta_rel();
    vcs.set_dirty(&[meta_rel.as_str()]);
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let out = directive::archive(&engine, fx.session_name(), false).expect("archive");
    assert_eq!(out.archive_branch, "chore/archive-26-01-15-vendor-table");
    let session = fx.session().expect("session");
    assert_eq!(session.doc.meta.status, DirectiveStatus::Archived);
    assert_eq!(session.doc.meta.bucket, "archived");

    let log = vcs.mutations();
    assert_eq!(log[0], format!("create_branch {} dev", out.archive_branch));
    assert!(log[1].starts_with("stage "));
    assert_eq!(log[2], "commit chore(directive): archive 26-01-15_vendor-table");
    assert_eq!(log[3], "checkout dev");
    assert!(log[4].starts_with(&format!("merge {}", out.archive_branch)));
    assert_eq!(log[5], format!("delete_branch {}", out.archive_branch));
    assert_eq!(vcs.current(), "dev");
    assert!(!vcs.has_branch(&out.archive_branch));
}

#[test]
fn archive_rejects_unrelated_changes_and_wrong_branch() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.set_dirty(&["apps/web/app/vendors/page.tsx"]);
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let err = directive::archive(&engine, fx.session_name(), false).expect_err("dirty");
    assert!(matches!(lifecycle_err(&err), LifecycleError::DirtyWorkingTree { .. }));

    vcs.set_dirty(&[]);
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.set_current(BRANCH);
    let err = directive::archive(&engine, fx.session_name(), false).expect_err("branch");
    assert!(matches!(lifecycle_err(&err), LifecycleError::BranchMismatch { .. }));
    assert!(vcs.mutations().is_empty());
}

#[test]
fn archive_failure_mid_sequence_reports_recovery() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.fail_on("merge");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::archive(&engine, fx.session_name(), false).expect_err("merge fails");
    assert!(matches!(lifecycle_err(&err), LifecycleError::Interrupted { .. }));
    let text = err.to_string();
    assert!(text.contains("git status --short"), "{text}");
    assert!(
        text.contains("git branch -D chore/archive-26-01-15-vendor-table"),
        "{text}"
    );
    assert!(text.contains("Directive files remain at"), "{text}");
    // No rollback: the archive branch is still there.
    assert!(vcs.has_branch("chore/archive-26-01-15-vendor-table"));
}

#[test]
fn archive_refuses_existing_archive_branch() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch("chore/archive-26-01-15-vendor-table", "dev")
        .expect("branch");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let err = directive::archive(&engine, fx.session_name(), false).expect_err("exists");
    assert!(matches!(lifecycle_err(&err), LifecycleError::PolicyViolation(_)));
}

#[test]
fn merge_uses_ancestry_and_never_mutates_vcs() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::merge(&engine, fx.session_name(), false).expect_err("diverged");
    match lifecycle_err(&err) {
        LifecycleError::NotMerged { guidance, .. } => {
            assert!(guidance.contains(&format!("git merge --no-ff {BRANCH}")));
            assert!(guidance.contains("git push origin dev"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        fx.session().expect("session").doc.meta.directive_merge_status,
        MergeStatus::Open
    );

    vcs.land(BRANCH, "dev").expect("land");
    let out = directive::merge(&engine, fx.session_name(), false).expect("merge");
    assert_eq!(out.state, MergeState::Recorded);
    assert_eq!(
        fx.session().expect("session").doc.meta.directive_merge_status,
        MergeStatus::Merged
    );

    let again = directive::merge(&engine, fx.session_name(), false).expect("rerun");
    assert_eq!(again.state, MergeState::AlreadyRecorded);
    assert!(vcs.mutations().is_empty());
}

#[test]
fn merge_falls_back_to_remote_tracking_ref() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.land(BRANCH, "dev").expect("land");
    vcs.move_to_remote("origin", BRANCH).expect("remote");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let out = directive::merge(&engine, fx.session_name(), true).expect("merge");
    assert_eq!(out.source_ref, format!("origin/{BRANCH}"));
    assert_eq!(out.state, MergeState::WouldRecord);
    assert_eq!(
        fx.session().expect("session").doc.meta.directive_merge_status,
        MergeStatus::Open
    );
}

#[test]
fn merge_requires_branch_somewhere_and_distinct_from_base() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let err = directive::merge(&engine, fx.session_name(), false).expect_err("missing");
    assert!(matches!(lifecycle_err(&err), LifecycleError::BranchMissing { .. }));

    fx.edit_meta(|meta| meta.directive_branch = "dev".to_string())
        .expect("edit");
    let err = directive::merge(&engine, fx.session_name(), false).expect_err("same");
    assert!(matches!(lifecycle_err(&err), LifecycleError::PolicyViolation(_)));
}

#[test]
fn cleanup_refuses_unmerged_branch() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let err = directive::cleanup(&engine, fx.session_name(), false).expect_err("unmerged");
    assert!(matches!(lifecycle_err(&err), LifecycleError::NotMerged { .. }));
    assert!(vcs.has_branch(BRANCH));
    assert!(vcs.mutations().is_empty());
}

#[test]
fn cleanup_switches_to_base_and_deletes_merged_branch() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.land(BRANCH, "dev").expect("land");
    vcs.set_current(BRANCH);
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());

    let out = directive::cleanup(&engine, fx.session_name(), false).expect("cleanup");
    assert!(out.deleted);
    assert_eq!(
        vcs.mutations(),
        vec!["checkout dev".to_string(), format!("delete_branch {BRANCH}")]
    );

    let again = directive::cleanup(&engine, fx.session_name(), false).expect("nothing left");
    assert!(!again.deleted);
}

#[test]
fn cleanup_never_touches_protected_branches() {
    let fx = fixture();
    fx.edit_meta(|meta| {
        meta.directive_branch = "dev".to_string();
        meta.directive_base_branch = "main".to_string();
    })
    .expect("edit");
    let vcs = FakeVcs::new("main");
    vcs.add_branch("dev", "main").expect("branch");
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let err = directive::cleanup(&engine, fx.session_name(), false).expect_err("protected");
    assert!(matches!(lifecycle_err(&err), LifecycleError::PolicyViolation(_)));
    assert!(vcs.has_branch("dev"));
}

#[test]
fn cleanup_dry_run_reports_plan_only() {
    let fx = fixture();
    let vcs = FakeVcs::new("dev");
    vcs.add_branch(BRANCH, "dev").expect("branch");
    vcs.land(BRANCH, "dev").expect("land");
    vcs.set_dirty(&["notes.txt"]);
    let engine = engine(&fx, &vcs, &AcceptAll, ExecutionContext::default());
    let out = directive::cleanup(&engine, fx.session_name(), true).expect("plan");
    assert!(!out.deleted);
    assert!(out.steps.entries().iter().any(|s| s.contains(&format!("branch -d {BRANCH}"))));
    assert!(vcs.mutations().is_empty());
}

#[test]
fn scope_report_lists_prefixes_and_intersections() {
    let fx = fixture();
    fx.add_task("app-shell", &["apps/web/app"], &["true"])
        .expect("task");
    let session = fx.session().expect("session");
    let report = directive::scope(fx.root(), &session).expect("scope");
    assert!(report.prefixes.contains(&"apps/web/app".to_string()));
    assert!(report.prefixes.contains(&session.rel));
    assert_eq!(report.intersections.len(), 1);
    assert!(report.skipped.is_empty());
}
