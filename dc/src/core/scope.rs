//! Write-scope prefixes and task scope intersections.
//!
//! A scope prefix is a repo-relative path with `/` separators, no leading
//! `./`, no trailing slash, and no `..` segments. A file is inside a prefix
//! when it equals the prefix or sits below it (`prefix + "/"`).

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::LifecycleError;

/// Maximum offenders listed in a scope violation message.
pub const MAX_REPORTED_OFFENDERS: usize = 20;

/// Normalize a declared scope string into a canonical prefix.
///
/// Returns an empty string when the input cannot be expressed as a
/// non-escaping repo-relative prefix (empty, absolute, `.`, or contains `..`).
pub fn normalize_scope_path(raw: &str) -> String {
    let mut value = strip_annotations(raw.trim());
    value = value
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .trim()
        .replace('\\', "/");

    while let Some(rest) = value.strip_prefix("./") {
        value = rest.to_string();
    }

    if let Some(idx) = value.find("/...") {
        value.truncate(idx);
    }
    if let Some(idx) = value.find('*') {
        value.truncate(idx);
        if !value.ends_with('/') {
            // `src/foo*.ts` narrows to its containing directory.
            match value.rfind('/') {
                Some(slash) => value.truncate(slash),
                None => value.clear(),
            }
        }
    }

    if value.is_empty() || is_absolute(&value) {
        return String::new();
    }

    let mut segments = Vec::new();
    for segment in value.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return String::new(),
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn strip_annotations(raw: &str) -> String {
    let mut value = raw.to_string();
    if let Some(idx) = value.find(" #") {
        value.truncate(idx);
    }
    let trimmed = value.trim_end();
    if trimmed.ends_with(')')
        && let Some(idx) = trimmed.rfind(" (")
    {
        value.truncate(idx);
    }
    value.trim().to_string()
}

fn is_absolute(value: &str) -> bool {
    if value.starts_with('/') {
        return true;
    }
    let bytes = value.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// True if `path` equals `prefix` or is nested below it.
pub fn path_within_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// True if one prefix equals or is a path-ancestor of the other.
pub fn prefixes_intersect(a: &str, b: &str) -> bool {
    path_within_prefix(a, b) || path_within_prefix(b, a)
}

/// Normalize, drop empties, sort, and dedupe a set of raw scope strings.
pub fn canonical_prefixes<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    raw.into_iter()
        .map(normalize_scope_path)
        .filter(|prefix| !prefix.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Files from `files` that fall outside every prefix.
///
/// An empty prefix set declares no scope, so nothing is out of scope.
pub fn files_outside_scope(files: &[String], prefixes: &[String]) -> Vec<String> {
    if prefixes.is_empty() {
        return Vec::new();
    }
    files
        .iter()
        .filter(|file| {
            let file = file.replace('\\', "/");
            !prefixes
                .iter()
                .any(|prefix| path_within_prefix(&file, prefix))
        })
        .cloned()
        .collect()
}

/// Fail with one aggregated `ScopeViolation` if any dirty file is out of scope.
pub fn assert_dirty_files_within_scope(
    dirty: &[String],
    prefixes: &[String],
    extra_allowed: &[String],
) -> Result<(), LifecycleError> {
    let mut allowed: Vec<String> = prefixes.to_vec();
    allowed.extend(canonical_prefixes(extra_allowed.iter().map(String::as_str)));
    let offenders = files_outside_scope(dirty, &allowed);
    if offenders.is_empty() {
        return Ok(());
    }
    Err(LifecycleError::ScopeViolation(render_offenders(&offenders)))
}

fn render_offenders(offenders: &[String]) -> String {
    let mut msg = format!(
        "{} dirty file(s) outside directive scope:",
        offenders.len()
    );
    for file in offenders.iter().take(MAX_REPORTED_OFFENDERS) {
        msg.push_str("\n  - ");
        msg.push_str(file);
    }
    if offenders.len() > MAX_REPORTED_OFFENDERS {
        msg.push_str(&format!(
            "\n  ... {} more",
            offenders.len() - MAX_REPORTED_OFFENDERS
        ));
    }
    msg
}

/// Scope contract of one task, as needed for intersection checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskScope {
    /// Task slug (file stem without `.task.json`).
    pub slug: String,
    pub id: String,
    pub depends_on: Vec<String>,
    pub prefixes: Vec<String>,
}

impl TaskScope {
    fn depends_on_task(&self, other: &TaskScope) -> bool {
        self.depends_on
            .iter()
            .map(|dep| dep.trim())
            .any(|dep| (!other.id.is_empty() && dep == other.id) || dep == other.slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixOverlap {
    pub left: String,
    pub right: String,
}

/// One pair of tasks whose declared scopes overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskIntersection {
    pub task_a: String,
    pub task_b: String,
    pub overlaps: Vec<PrefixOverlap>,
    /// True when either task depends on the other (intentional staged overlap).
    pub linked_by_dependency: bool,
}

/// Report each unordered task pair with overlapping prefixes exactly once.
pub fn find_intersections(tasks: &[TaskScope]) -> Vec<TaskIntersection> {
    let mut out = Vec::new();
    for (i, left) in tasks.iter().enumerate() {
        for right in &tasks[i + 1..] {
            let mut overlaps = Vec::new();
            for a in &left.prefixes {
                for b in &right.prefixes {
                    if prefixes_intersect(a, b) {
                        overlaps.push(PrefixOverlap {
                            left: a.clone(),
                            right: b.clone(),
                        });
                    }
                }
            }
            if overlaps.is_empty() {
                continue;
            }
            out.push(TaskIntersection {
                task_a: left.slug.clone(),
                task_b: right.slug.clone(),
                overlaps,
                linked_by_dependency: left.depends_on_task(right) || right.depends_on_task(left),
            });
        }
    }
    out
}
