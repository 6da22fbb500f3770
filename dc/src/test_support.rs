//! Test-only helpers: document builders, session fixtures, a scratch git
//! repository, and an in-memory [`VcsGateway`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Map, json};
use tempfile::TempDir;

use crate::core::scope::path_within_prefix;
use crate::core::types::{COMMIT_POLICY_END_OF_DIRECTIVE, DirectiveStatus, MergeStatus, TaskStatus};
use crate::documents::{
    AllowedFile, DIRECTIVE_KIND, DirectiveDoc, DirectiveMeta, HANDOFF_KIND, Handoff, HandoffDoc,
    SCHEMA_VERSION, TASK_KIND, TaskBody, TaskDoc, TaskMeta, ValidationPlan,
};
use crate::engine::Workspace;
use crate::io::config::DcConfig;
use crate::io::git::VcsGateway;
use crate::io::policy::{
    BOOTSTRAP_FROM_LOCAL_BASE, CORE_POLICY_FILE, LIFECYCLE_POLICY_FILE, LifecyclePolicy,
    POLICY_KIND,
};
use crate::io::session::{Session, load_session, write_json};
use crate::io::validator::MetadataValidator;

/// Fixed date prefix for fixture session directories.
pub const SESSION_PREFIX: &str = "26-01-15_";

/// Schema-valid directive meta on `feat/<slug>` based on `dev`.
pub fn directive_meta(slug: &str) -> DirectiveMeta {
    DirectiveMeta {
        id: uuid::Uuid::new_v4().to_string(),
        directive_slug: slug.to_string(),
        title: format!("{slug} title"),
        status: DirectiveStatus::Todo,
        bucket: "todo".to_string(),
        owner: None,
        assignee: None,
        priority: "medium".to_string(),
        session_priority: "medium".to_string(),
        directive_branch: format!("feat/{slug}"),
        directive_base_branch: "dev".to_string(),
        directive_merge_status: MergeStatus::Open,
        commit_policy: COMMIT_POLICY_END_OF_DIRECTIVE.to_string(),
        goals: Vec::new(),
        depends_on: Vec::new(),
        blocked_by: Vec::new(),
        related: Vec::new(),
        created: "2026-01-15T00:00:00Z".to_string(),
        updated: "2026-01-15T00:00:00Z".to_string(),
        extra: Map::new(),
    }
}

pub fn directive_doc(slug: &str) -> DirectiveDoc {
    DirectiveDoc {
        kind: DIRECTIVE_KIND.to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        meta: directive_meta(slug),
        extra: Map::new(),
    }
}

/// Architect-to-executor handoff bound to `branch`.
pub fn handoff(branch: &str) -> Handoff {
    Handoff {
        from_role: "architect".to_string(),
        to_role: "executor".to_string(),
        trigger: "plan approved".to_string(),
        objective: "execute directive".to_string(),
        blocking_rule: String::new(),
        task_file: None,
        directive_branch: branch.to_string(),
        worktree_mode: "shared".to_string(),
        allowlist_paths: Vec::new(),
        extra: Map::new(),
    }
}

/// A `todo` task declaring `allowed` paths and validation `commands`.
pub fn task_doc(slug: &str, allowed: &[&str], commands: &[&str]) -> TaskDoc {
    let meta = TaskMeta {
        id: uuid::Uuid::new_v4().to_string(),
        title: format!("{slug} title"),
        summary: String::new(),
        status: TaskStatus::Todo,
        depends_on: Vec::new(),
        result: None,
        updated: String::new(),
        extra: Map::new(),
    };
    let task = TaskBody {
        allowed_files: allowed
            .iter()
            .map(|path| AllowedFile::Path(path.to_string()))
            .collect(),
        validation: ValidationPlan {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            extra: Map::new(),
        },
        extra: Map::new(),
    };
    TaskDoc {
        kind: TASK_KIND.to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        meta,
        task,
        extra: Map::new(),
    }
}

/// Write both policy files so that loading them yields `policy`.
pub fn write_policy_files(dir: &Path, policy: &LifecyclePolicy) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    write_json(
        &dir.join(CORE_POLICY_FILE),
        &json!({
            "kind": POLICY_KIND,
            "policy_id": "core",
            "version": "1",
            "executor_execution_context": {
                "require_handoff_for_execution": policy.require_handoff
            }
        }),
    )?;
    let bootstrap = if policy.allow_branch_bootstrap {
        BOOTSTRAP_FROM_LOCAL_BASE
    } else {
        "require_existing_branch"
    };
    write_json(
        &dir.join(LIFECYCLE_POLICY_FILE),
        &json!({
            "kind": POLICY_KIND,
            "policy_id": "executor_lifecycle",
            "version": "1",
            "lifecycle": {
                "commit_policy_values": policy.commit_policy_values,
                "branch_bootstrap_mode": bootstrap,
                "allow_task_status_updates_via_lifecycle": policy.allow_task_status_updates,
                "allow_task_updated_timestamp_via_lifecycle": policy.allow_task_timestamp_updates,
                "auto_push_on_task_finish": policy.auto_push
            }
        }),
    )
}

/// Run `git` in `root`, failing on a non-zero exit.
pub fn git(root: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

/// `git init` on branch `dev` with a committed README.
fn init_git_repo(root: &Path) -> Result<()> {
    git(root, &["init", "-q"])?;
    git(root, &["checkout", "-q", "-b", "dev"])?;
    git(root, &["config", "user.email", "test@example.com"])?;
    git(root, &["config", "user.name", "test"])?;
    git(root, &["config", "commit.gpgsign", "false"])?;
    fs::write(root.join("README.md"), "hi\n").context("write README")?;
    git(root, &["add", "README.md"])?;
    git(root, &["commit", "-q", "-m", "chore: init"])?;
    Ok(())
}

/// Scratch git repository on `dev` with one commit.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        init_git_repo(temp.path())?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        write_file(self.root(), rel, contents)
    }

    /// Write, stage, and commit one file on the current branch.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> Result<()> {
        self.write_file(rel, contents)?;
        git(self.root(), &["add", "--", rel])?;
        git(self.root(), &["commit", "-q", "-m", message])?;
        Ok(())
    }
}

fn write_file(root: &Path, rel: &str, contents: &str) -> Result<PathBuf> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// A repository root holding one directive session under the default
/// directives root, plus default lifecycle policies.
pub struct SessionFixture {
    temp: TempDir,
    name: String,
    slug: String,
}

impl SessionFixture {
    pub fn new(slug: &str) -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let fx = Self {
            temp,
            name: format!("{SESSION_PREFIX}{slug}"),
            slug: slug.to_string(),
        };
        fx.add_session(&fx.name, slug)?;
        fx.write_policies(&LifecyclePolicy::default())?;
        Ok(fx)
    }

    /// Same as [`SessionFixture::new`], inside a git repository on `dev`
    /// with everything committed.
    pub fn with_git(slug: &str) -> Result<Self> {
        let fx = Self::new(slug)?;
        init_git_repo(fx.root())?;
        fx.commit_all("chore: add directive")?;
        Ok(fx)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn session_name(&self) -> &str {
        &self.name
    }

    pub fn session_dir(&self) -> PathBuf {
        self.directives_dir().join(&self.name)
    }

    pub fn session(&self) -> Result<Session> {
        load_session(self.root(), &self.session_dir())
    }

    pub fn workspace(&self) -> Result<Workspace> {
        Workspace::load(self.root())
    }

    fn directives_dir(&self) -> PathBuf {
        DcConfig::default().directives_dir(self.root())
    }

    /// Create another session directory; returns its meta path.
    pub fn add_session(&self, name: &str, slug: &str) -> Result<PathBuf> {
        let dir = self.directives_dir().join(name);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(format!("{slug}.meta.json"));
        write_json(&path, &directive_doc(slug))?;
        Ok(path)
    }

    pub fn add_task(&self, slug: &str, allowed: &[&str], commands: &[&str]) -> Result<PathBuf> {
        let path = self.session_dir().join(format!("{slug}.task.json"));
        write_json(&path, &task_doc(slug, allowed, commands))?;
        Ok(path)
    }

    pub fn add_handoff(&self, branch: &str, allowlist: &[&str]) -> Result<PathBuf> {
        let mut body = handoff(branch);
        body.allowlist_paths = allowlist.iter().map(|p| p.to_string()).collect();
        let doc = HandoffDoc {
            kind: HANDOFF_KIND.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            handoff: body,
            extra: Map::new(),
        };
        let path = self.session_dir().join(format!("{}.handoff.json", self.slug));
        write_json(&path, &doc)?;
        Ok(path)
    }

    /// Rewrite the session meta through `edit`.
    pub fn edit_meta(&self, edit: impl FnOnce(&mut DirectiveMeta)) -> Result<()> {
        let mut session = self.session()?;
        edit(&mut session.doc.meta);
        session.save_meta()
    }

    pub fn write_policies(&self, policy: &LifecyclePolicy) -> Result<()> {
        write_policy_files(&DcConfig::default().policy_path(self.root()), policy)
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        write_file(self.root(), rel, contents)
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        git(self.root(), &["add", "-A"])?;
        git(self.root(), &["commit", "-q", "-m", message])?;
        Ok(())
    }
}

/// Accepts every file.
pub struct AcceptAll;

impl MetadataValidator for AcceptAll {
    fn validate(&self, _root: &Path, _files: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Rejects every call with `MetadataInvalid`.
pub struct RejectAll;

impl MetadataValidator for RejectAll {
    fn validate(&self, _root: &Path, files: &[String]) -> Result<()> {
        Err(crate::error::LifecycleError::metadata(format!(
            "rejected {} file(s)",
            files.len()
        ))
        .into())
    }
}

#[derive(Debug, Default)]
struct FakeState {
    /// commit id -> parents
    commits: Vec<Vec<usize>>,
    branches: BTreeMap<String, usize>,
    remotes: BTreeMap<String, usize>,
    upstreams: BTreeSet<String>,
    current: String,
    dirty: Vec<String>,
    staged: Vec<String>,
    fail_on: Option<String>,
    mutations: Vec<String>,
}

impl FakeState {
    fn resolve(&self, reference: &str) -> Result<usize> {
        self.branches
            .get(reference)
            .or_else(|| self.remotes.get(reference))
            .copied()
            .ok_or_else(|| anyhow!("unknown ref {reference}"))
    }

    fn reachable(&self, from: usize, target: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.commits[id].iter().copied());
            }
        }
        false
    }

    fn new_commit(&mut self, parents: Vec<usize>) -> usize {
        self.commits.push(parents);
        self.commits.len() - 1
    }

    fn mutate(&mut self, op: &str, entry: String) -> Result<()> {
        if self.fail_on.as_deref() == Some(op) {
            bail!("injected {op} failure");
        }
        self.mutations.push(entry);
        Ok(())
    }
}

/// In-memory version control with a real commit graph.
///
/// Mutations are appended to a log so tests can assert that a failed
/// precondition left version control untouched.
pub struct FakeVcs {
    state: RefCell<FakeState>,
}

impl FakeVcs {
    /// One root commit on `base`, checked out, clean.
    pub fn new(base: &str) -> Self {
        let mut state = FakeState::default();
        let root = state.new_commit(Vec::new());
        state.branches.insert(base.to_string(), root);
        state.current = base.to_string();
        Self {
            state: RefCell::new(state),
        }
    }

    /// Create `branch` at `from` with one extra commit (without checking it out).
    pub fn add_branch(&self, branch: &str, from: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let tip = state.resolve(from)?;
        let id = state.new_commit(vec![tip]);
        state.branches.insert(branch.to_string(), id);
        Ok(())
    }

    /// Merge `branch` into `base` outside the lifecycle engine.
    pub fn land(&self, branch: &str, base: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let source = state.resolve(branch)?;
        let target = state.resolve(base)?;
        let id = state.new_commit(vec![target, source]);
        state.branches.insert(base.to_string(), id);
        Ok(())
    }

    /// Publish `branch` on `remote` and drop the local copy.
    pub fn move_to_remote(&self, remote: &str, branch: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let tip = state.resolve(branch)?;
        state.branches.remove(branch);
        state.remotes.insert(format!("{remote}/{branch}"), tip);
        Ok(())
    }

    pub fn set_current(&self, branch: &str) {
        self.state.borrow_mut().current = branch.to_string();
    }

    pub fn set_dirty(&self, files: &[&str]) {
        self.state.borrow_mut().dirty = files.iter().map(|f| f.to_string()).collect();
    }

    /// Make the named mutation (`checkout`, `commit`, `merge`, ...) fail.
    pub fn fail_on(&self, op: &str) {
        self.state.borrow_mut().fail_on = Some(op.to_string());
    }

    pub fn current(&self) -> String {
        self.state.borrow().current.clone()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state.borrow().branches.contains_key(branch)
    }

    pub fn has_remote(&self, remote_ref: &str) -> bool {
        self.state.borrow().remotes.contains_key(remote_ref)
    }

    pub fn mutations(&self) -> Vec<String> {
        self.state.borrow().mutations.clone()
    }
}

impl VcsGateway for FakeVcs {
    fn current_branch(&self) -> Result<String> {
        Ok(self.current())
    }

    fn branch_exists_local(&self, branch: &str) -> Result<bool> {
        Ok(self.has_branch(branch))
    }

    fn branch_exists_remote(&self, remote: &str, branch: &str) -> Result<bool> {
        Ok(self.has_remote(&format!("{remote}/{branch}")))
    }

    fn changed_files(&self) -> Result<Vec<String>> {
        let state = self.state.borrow();
        let mut files = state.dirty.clone();
        files.extend(state.staged.iter().cloned());
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn short_revision(&self) -> Result<String> {
        let state = self.state.borrow();
        let tip = state.resolve(&state.current)?;
        Ok(format!("{tip:07x}"))
    }

    fn is_ancestor(&self, candidate: &str, base: &str) -> Result<bool> {
        let state = self.state.borrow();
        let candidate = state.resolve(candidate)?;
        let base = state.resolve(base)?;
        Ok(state.reachable(base, candidate))
    }

    fn has_upstream(&self, branch: &str) -> Result<bool> {
        Ok(self.state.borrow().upstreams.contains(branch))
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.resolve(branch)?;
        state.mutate("checkout", format!("checkout {branch}"))?;
        state.current = branch.to_string();
        Ok(())
    }

    fn create_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.branches.contains_key(branch) {
            bail!("branch {branch} already exists");
        }
        let tip = state.resolve(start_point)?;
        state.mutate("create_branch", format!("create_branch {branch} {start_point}"))?;
        state.branches.insert(branch.to_string(), tip);
        state.current = branch.to_string();
        Ok(())
    }

    fn stage(&self, paths: &[String]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.mutate("stage", format!("stage {}", paths.join(" ")))?;
        let (picked, rest): (Vec<String>, Vec<String>) =
            state.dirty.drain(..).partition(|file| {
                paths
                    .iter()
                    .any(|p| path_within_prefix(file, p.trim_end_matches('/')))
            });
        state.dirty = rest;
        state.staged.extend(picked);
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        state.mutate("commit", format!("commit {message}"))?;
        if state.staged.is_empty() {
            return Ok(false);
        }
        state.staged.clear();
        let current = state.current.clone();
        let tip = state.resolve(&current)?;
        let id = state.new_commit(vec![tip]);
        state.branches.insert(current, id);
        Ok(true)
    }

    fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let source = state.resolve(branch)?;
        state.mutate("merge", format!("merge {branch} ({message})"))?;
        let current = state.current.clone();
        let tip = state.resolve(&current)?;
        let id = state.new_commit(vec![tip, source]);
        state.branches.insert(current, id);
        Ok(())
    }

    fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.current == branch {
            bail!("cannot delete checked-out branch {branch}");
        }
        let tip = state.resolve(branch)?;
        let head = state.resolve(&state.current.clone())?;
        if !force && !state.reachable(head, tip) {
            bail!("branch {branch} is not fully merged");
        }
        state.mutate("delete_branch", format!("delete_branch {branch}"))?;
        state.branches.remove(branch);
        Ok(())
    }

    fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let tip = state.resolve(branch)?;
        state.mutate("push", format!("push {remote} {branch}"))?;
        state.remotes.insert(format!("{remote}/{branch}"), tip);
        if set_upstream {
            state.upstreams.insert(branch.to_string());
        }
        Ok(())
    }
}
