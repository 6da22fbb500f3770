//! Architect authoring: scaffold new directive sessions and tasks.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::core::capability::{Capability, ExecutionContext, assert_capability};
use crate::core::types::{
    COMMIT_POLICY_END_OF_DIRECTIVE, DirectiveStatus, MergeStatus, TaskStatus, slugify, utc_now,
};
use crate::documents::{
    AllowedFile, DIRECTIVE_KIND, DirectiveDoc, DirectiveMeta, META_SUFFIX, SCHEMA_VERSION,
    TASK_KIND, TASK_SUFFIX, TaskBody, TaskDoc, TaskMeta, ValidationPlan,
};
use crate::engine::{StepLog, Workspace};
use crate::error::LifecycleError;
use crate::io::session::{existing_meta_files, repo_relative, write_json};

/// Inputs for `directive new`.
#[derive(Debug, Clone, Default)]
pub struct NewDirective {
    pub title: String,
    pub summary: Option<String>,
    /// Defaults to the slugified title.
    pub slug: Option<String>,
    /// Session directory name; defaults to `yy-mm-dd_<slug>`.
    pub session: Option<String>,
    pub branch: Option<String>,
    pub base: Option<String>,
    pub commit_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Session directory name.
    pub session: String,
    /// Repo-relative path of the written (or planned) file.
    pub rel: String,
    pub steps: StepLog,
}

/// Create a session directory with a fresh `<slug>.meta.json`.
#[instrument(skip_all, fields(title = %draft.title))]
pub fn new_directive(
    workspace: &Workspace,
    ctx: &ExecutionContext,
    draft: &NewDirective,
    dry_run: bool,
) -> Result<Created> {
    assert_capability(Capability::ArchitectAuthoring, ctx, "directive new")?;
    let title = draft.title.trim();
    if title.is_empty() {
        return Err(LifecycleError::metadata("directive title must be non-empty").into());
    }
    let slug = checked_slug(draft.slug.as_deref().unwrap_or(title))?;
    let session = match draft.session.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{}_{slug}", chrono::Utc::now().format("%y-%m-%d")),
    };
    if session.contains(['/', '\\']) || session == "." || session == ".." {
        return Err(LifecycleError::metadata(format!("invalid session name: {session}")).into());
    }

    let dir = workspace.config.directives_dir(&workspace.root).join(&session);
    let meta_path = dir.join(format!("{slug}{META_SUFFIX}"));
    if let Some(existing) = existing_meta_files(&dir)?.first() {
        return Err(LifecycleError::metadata(format!(
            "session {session} already has a directive meta: {}",
            existing.display()
        ))
        .into());
    }
    let rel = repo_relative(&workspace.root, &meta_path);

    let now = utc_now();
    let mut extra = Map::new();
    if let Some(summary) = draft.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        extra.insert("summary".to_string(), Value::String(summary.to_string()));
    }
    let doc = DirectiveDoc {
        kind: DIRECTIVE_KIND.to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        meta: DirectiveMeta {
            id: uuid::Uuid::new_v4().to_string(),
            directive_slug: slug.clone(),
            title: title.to_string(),
            status: DirectiveStatus::Todo,
            bucket: "todo".to_string(),
            owner: None,
            assignee: None,
            priority: "medium".to_string(),
            session_priority: "medium".to_string(),
            directive_branch: non_blank(draft.branch.as_deref()).unwrap_or_else(|| format!("feat/{slug}")),
            directive_base_branch: non_blank(draft.base.as_deref()).unwrap_or_else(|| "dev".to_string()),
            directive_merge_status: MergeStatus::Open,
            commit_policy: non_blank(draft.commit_policy.as_deref())
                .unwrap_or_else(|| COMMIT_POLICY_END_OF_DIRECTIVE.to_string()),
            goals: Vec::new(),
            depends_on: Vec::new(),
            blocked_by: Vec::new(),
            related: Vec::new(),
            created: now.clone(),
            updated: now,
            extra,
        },
        extra: Map::new(),
    };

    let mut steps = StepLog::new(dry_run);
    if !dry_run {
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        write_json(&meta_path, &doc)?;
        info!(session = %session, "directive created");
    }
    steps.record(format!("write {rel}"));
    Ok(Created {
        session,
        rel,
        steps,
    })
}

/// Inputs for `task new`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub summary: Option<String>,
    pub slug: Option<String>,
    pub allowed_files: Vec<String>,
    pub validation_commands: Vec<String>,
    pub depends_on: Vec<String>,
}

/// Add `<slug>.task.json` to an existing session.
#[instrument(skip_all, fields(session = session_ref, title = %draft.title))]
pub fn new_task(
    workspace: &Workspace,
    ctx: &ExecutionContext,
    session_ref: &str,
    draft: &NewTask,
    dry_run: bool,
) -> Result<Created> {
    assert_capability(Capability::ArchitectAuthoring, ctx, "task new")?;
    let title = draft.title.trim();
    if title.is_empty() {
        return Err(LifecycleError::metadata("task title must be non-empty").into());
    }
    let allowed = trimmed(&draft.allowed_files);
    let commands = trimmed(&draft.validation_commands);
    if allowed.is_empty() {
        return Err(LifecycleError::metadata("task new requires at least one --allowed path").into());
    }
    if commands.is_empty() {
        return Err(
            LifecycleError::metadata("task new requires at least one --validate command").into(),
        );
    }
    let slug = checked_slug(draft.slug.as_deref().unwrap_or(title))?;

    let mut steps = StepLog::new(dry_run);
    let (session_name, path): (String, PathBuf) = match workspace.session(session_ref) {
        Ok(session) => {
            let path = session.dir.join(format!("{slug}{TASK_SUFFIX}"));
            (session.name, path)
        }
        // The session is only planned when authoring runs dry.
        Err(_) if dry_run => {
            let path = workspace
                .config
                .directives_dir(&workspace.root)
                .join(session_ref)
                .join(format!("{slug}{TASK_SUFFIX}"));
            (session_ref.to_string(), path)
        }
        Err(err) => return Err(err),
    };
    if path.exists() {
        return Err(LifecycleError::metadata(format!(
            "task already exists: {}",
            path.display()
        ))
        .into());
    }
    let rel = repo_relative(&workspace.root, &path);

    let doc = TaskDoc {
        kind: TASK_KIND.to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        meta: TaskMeta {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            summary: draft.summary.clone().unwrap_or_default(),
            status: TaskStatus::Todo,
            depends_on: trimmed(&draft.depends_on),
            result: None,
            updated: utc_now(),
            extra: Map::new(),
        },
        task: TaskBody {
            allowed_files: allowed.into_iter().map(AllowedFile::Path).collect(),
            validation: ValidationPlan {
                commands,
                extra: Map::new(),
            },
            extra: Map::new(),
        },
        extra: Map::new(),
    };

    if !dry_run {
        write_json(&path, &doc)?;
        info!(task = %slug, "task created");
    }
    steps.record(format!("write {rel}"));
    Ok(Created {
        session: session_name,
        rel,
        steps,
    })
}

fn checked_slug(raw: &str) -> Result<String> {
    let slug = slugify(raw);
    if slug.is_empty() {
        return Err(LifecycleError::metadata(format!("cannot derive a slug from '{raw}'")).into());
    }
    Ok(slug)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn trimmed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
