//! Directive session directories: resolution, document load/save, scope scans.
//!
//! A session directory holds exactly one `<slug>.meta.json`, zero or more
//! `<slug>.task.json`, and at most one `<directive_slug>.handoff.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::core::scope::{TaskIntersection, TaskScope, canonical_prefixes, find_intersections};
use crate::documents::{
    DirectiveDoc, HANDOFF_SUFFIX, Handoff, HandoffDoc, META_SUFFIX, TASK_SUFFIX, TaskDoc,
};
use crate::error::LifecycleError;
use crate::io::config::DcConfig;

static META_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*\.meta\.json$").unwrap());

/// A resolved directive session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Repository root.
    pub root: PathBuf,
    /// Absolute session directory.
    pub dir: PathBuf,
    /// Session directory name (the `--session` handle).
    pub name: String,
    /// Session directory relative to the repository root, `/`-separated.
    pub rel: String,
    pub meta_path: PathBuf,
    pub doc: DirectiveDoc,
}

impl Session {
    /// Repo-relative path of a file inside this session.
    pub fn rel_path(&self, path: &Path) -> String {
        repo_relative(&self.root, path)
    }

    pub fn meta_rel(&self) -> String {
        self.rel_path(&self.meta_path)
    }

    pub fn save_meta(&self) -> Result<()> {
        write_json(&self.meta_path, &self.doc)
    }

    pub fn handoff_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}{HANDOFF_SUFFIX}", self.doc.meta.directive_slug))
    }

    /// Read the handoff if one exists for this directive.
    pub fn load_handoff(&self) -> Result<Option<Handoff>> {
        let path = self.handoff_path();
        if !path.exists() {
            return Ok(None);
        }
        let doc: HandoffDoc = load_json(&path)?;
        Ok(Some(doc.handoff))
    }

    /// Task file paths, sorted by name.
    pub fn task_files(&self) -> Result<Vec<PathBuf>> {
        list_files_with_suffix(&self.dir, TASK_SUFFIX)
    }

    /// Resolve `--task` as a slug or a `<slug>.task.json` file name.
    pub fn resolve_task(&self, task_ref: &str) -> Result<TaskHandle> {
        let raw = task_ref.trim();
        if raw.is_empty() {
            return Err(LifecycleError::metadata("missing required --task").into());
        }
        let file_name = if raw.ends_with(TASK_SUFFIX) {
            raw.to_string()
        } else {
            format!("{raw}{TASK_SUFFIX}")
        };
        if file_name.contains(['/', '\\']) || file_name.contains("..") {
            return Err(LifecycleError::metadata(format!(
                "task reference must be a slug or file name inside the session: {raw}"
            ))
            .into());
        }
        let Some(path) = self
            .task_files()?
            .into_iter()
            .find(|path| path.file_name().is_some_and(|name| name == file_name.as_str()))
        else {
            return Err(LifecycleError::metadata(format!("task not found: {raw}")).into());
        };
        let slug = file_name.trim_end_matches(TASK_SUFFIX).to_string();
        Ok(TaskHandle {
            rel: self.rel_path(&path),
            slug,
            path,
        })
    }

    /// Every JSON artifact in the session, repo-relative.
    pub fn artifact_files(&self) -> Result<Vec<String>> {
        Ok(list_files_with_suffix(&self.dir, ".json")?
            .iter()
            .map(|path| self.rel_path(path))
            .collect())
    }
}

/// A resolved task file inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub slug: String,
    pub path: PathBuf,
    pub rel: String,
}

impl TaskHandle {
    pub fn load(&self) -> Result<TaskDoc> {
        load_json(&self.path)
    }

    pub fn save(&self, doc: &TaskDoc) -> Result<()> {
        write_json(&self.path, doc)
    }
}

/// Resolve `--session` as a directory name under the directives root, or a
/// directive `meta.id`.
pub fn resolve_session(root: &Path, cfg: &DcConfig, session_ref: &str) -> Result<Session> {
    let reference = session_ref.trim();
    if reference.is_empty() {
        return Err(LifecycleError::metadata(
            "missing session identifier; pass --session (directory name or directive id)",
        )
        .into());
    }
    let directives = cfg.directives_dir(root);
    let exact = directives.join(reference);
    let dir = if !reference.contains(['/', '\\']) && !reference.starts_with('.') && exact.is_dir() {
        exact
    } else {
        find_session_by_id(&directives, reference)?
    };
    load_session(root, &dir)
}

/// Load the session rooted at `dir`.
pub fn load_session(root: &Path, dir: &Path) -> Result<Session> {
    let meta_path = find_meta_file(dir)?;
    let doc: DirectiveDoc = load_json(&meta_path)?;
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    debug!(session = %name, meta = %meta_path.display(), "resolved session");
    Ok(Session {
        root: root.to_path_buf(),
        rel: repo_relative(root, dir),
        dir: dir.to_path_buf(),
        name,
        meta_path,
        doc,
    })
}

fn find_session_by_id(directives: &Path, id: &str) -> Result<PathBuf> {
    let mut matches = Vec::new();
    if directives.is_dir() {
        for entry in fs::read_dir(directives)
            .with_context(|| format!("read directives root {}", directives.display()))?
        {
            let entry = entry.context("read directives entry")?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            // Sessions without a readable meta file cannot match an id.
            let Ok(meta_path) = find_meta_file(&path) else {
                continue;
            };
            let Ok(doc) = load_json::<DirectiveDoc>(&meta_path) else {
                continue;
            };
            if doc.meta.id == id {
                matches.push(path);
            }
        }
    }
    match matches.len() {
        0 => Err(LifecycleError::metadata(format!("session not found: {id}")).into()),
        1 => Ok(matches.remove(0)),
        _ => Err(LifecycleError::metadata(format!(
            "session id is ambiguous across directories: {id}"
        ))
        .into()),
    }
}

/// Locate the single `<slug>.meta.json` in a session directory.
pub fn find_meta_file(dir: &Path) -> Result<PathBuf> {
    let metas: Vec<PathBuf> = list_files_with_suffix(dir, META_SUFFIX)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| META_FILE_RE.is_match(&name.to_string_lossy()))
        })
        .collect();
    if metas.len() != 1 {
        return Err(LifecycleError::metadata(format!(
            "expected exactly one <directive_slug>.meta.json in {} (found {})",
            dir.display(),
            metas.len()
        ))
        .into());
    }
    Ok(metas[0].clone())
}

/// Parse a session document; malformed JSON or schema drift is `MetadataInvalid`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| {
        LifecycleError::metadata(format!("{}: {err}", path.display())).into()
    })
}

/// Serialize `value` to pretty-printed JSON with trailing newline, replacing the file.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))
}

/// A task file the scope scan could not use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTask {
    pub file: String,
    pub reason: String,
}

/// Parsed task scopes of one session plus the files that failed to parse.
#[derive(Debug, Clone, Default)]
pub struct TaskScan {
    pub tasks: Vec<TaskScope>,
    pub skipped: Vec<SkippedTask>,
}

/// Best-effort parse of every task file in `session_dir`.
pub fn scan_task_scopes(session_dir: &Path) -> Result<TaskScan> {
    let mut scan = TaskScan::default();
    for path in list_files_with_suffix(session_dir, TASK_SUFFIX)? {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match load_json::<TaskDoc>(&path) {
            Ok(doc) => scan.tasks.push(TaskScope {
                slug: file.trim_end_matches(TASK_SUFFIX).to_string(),
                id: doc.meta.id.clone(),
                depends_on: doc.meta.depends_on.clone(),
                prefixes: canonical_prefixes(
                    doc.task.allowed_files.iter().map(|entry| entry.path()),
                ),
            }),
            Err(err) => {
                warn!(file = %file, err = %err, "skipping unparsable task file");
                scan.skipped.push(SkippedTask {
                    file,
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok(scan)
}

/// Directive scope: the session directory plus every task's allowed paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeScan {
    /// Sorted, unique.
    pub prefixes: Vec<String>,
    pub skipped: Vec<SkippedTask>,
}

pub fn directive_scope_prefixes(root: &Path, session_dir: &Path) -> Result<ScopeScan> {
    let scan = scan_task_scopes(session_dir)?;
    let session_rel = repo_relative(root, session_dir);
    let mut raw: Vec<&str> = vec![session_rel.as_str()];
    raw.extend(
        scan.tasks
            .iter()
            .flat_map(|task| task.prefixes.iter().map(String::as_str)),
    );
    Ok(ScopeScan {
        prefixes: canonical_prefixes(raw),
        skipped: scan.skipped,
    })
}

/// Pairwise task scope overlaps within one session.
pub fn find_task_allowed_file_intersections(session_dir: &Path) -> Result<Vec<TaskIntersection>> {
    let scan = scan_task_scopes(session_dir)?;
    Ok(find_intersections(&scan.tasks))
}

/// Every `*.meta.json` in `dir`, well-named or not; empty when `dir` is missing.
pub fn existing_meta_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    list_files_with_suffix(dir, META_SUFFIX)
}

fn list_files_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_file() && entry.file_name().to_string_lossy().ends_with(suffix) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `/`-separated path of `path` relative to `root` (or `path` itself when outside).
pub fn repo_relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
