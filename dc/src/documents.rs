//! Typed session documents: directive meta, task, and handoff.
//!
//! Every object keeps unknown keys in a flattened `extra` map so that a
//! load/modify/write cycle never drops fields owned by other tooling.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::{DirectiveStatus, MergeStatus, TaskStatus, Verdict};

pub const META_SUFFIX: &str = ".meta.json";
pub const TASK_SUFFIX: &str = ".task.json";
pub const HANDOFF_SUFFIX: &str = ".handoff.json";

pub const DIRECTIVE_KIND: &str = "directive_session_meta";
pub const TASK_KIND: &str = "directive_task";
pub const HANDOFF_KIND: &str = "directive_handoff";
pub const SCHEMA_VERSION: &str = "1.0";

/// `<slug>.meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveDoc {
    #[serde(default = "directive_kind")]
    pub kind: String,
    #[serde(default = "schema_version")]
    pub schema_version: String,
    pub meta: DirectiveMeta,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveMeta {
    pub id: String,
    pub directive_slug: String,
    #[serde(default)]
    pub title: String,
    pub status: DirectiveStatus,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub session_priority: String,
    #[serde(default)]
    pub directive_branch: String,
    #[serde(default)]
    pub directive_base_branch: String,
    #[serde(default)]
    pub directive_merge_status: MergeStatus,
    #[serde(default)]
    pub commit_policy: String,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub related: Vec<String>,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `<slug>.task.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDoc {
    #[serde(default = "task_kind")]
    pub kind: String,
    #[serde(default = "schema_version")]
    pub schema_version: String,
    pub meta: TaskMeta,
    #[serde(default)]
    pub task: TaskBody,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub updated: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBody {
    #[serde(default)]
    pub allowed_files: Vec<AllowedFile>,
    #[serde(default)]
    pub validation: ValidationPlan,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An `allowed_files` entry: `{ "path": ..., ... }` or a bare path string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowedFile {
    Entry {
        path: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Path(String),
}

impl AllowedFile {
    pub fn path(&self) -> &str {
        match self {
            AllowedFile::Entry { path, .. } => path,
            AllowedFile::Path(path) => path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationPlan {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Evidence recorded by `task finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: String,
    pub validation: ValidationEvidence,
    pub updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEvidence {
    pub status: Verdict,
    pub commands: Vec<CommandEvidence>,
    pub changed_files: Vec<String>,
    pub branch: String,
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvidence {
    pub command: String,
    pub status: Verdict,
    /// `None` when the command was killed (timeout) or could not report a code.
    pub exit_code: Option<i32>,
}

/// `<directive_slug>.handoff.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffDoc {
    #[serde(default = "handoff_kind")]
    pub kind: String,
    #[serde(default = "schema_version")]
    pub schema_version: String,
    pub handoff: Handoff,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    #[serde(default)]
    pub from_role: String,
    #[serde(default)]
    pub to_role: String,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub blocking_rule: String,
    #[serde(default)]
    pub task_file: Option<String>,
    #[serde(default)]
    pub directive_branch: String,
    #[serde(default)]
    pub worktree_mode: String,
    #[serde(default, alias = "worktree_allowlist_paths")]
    pub allowlist_paths: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn directive_kind() -> String {
    DIRECTIVE_KIND.to_string()
}

fn task_kind() -> String {
    TASK_KIND.to_string()
}

fn handoff_kind() -> String {
    HANDOFF_KIND.to_string()
}

fn schema_version() -> String {
    SCHEMA_VERSION.to_string()
}
