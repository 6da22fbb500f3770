//! Shared status vocabularies for directive and task documents.
//!
//! Unknown values fail deserialization, which surfaces as `MetadataInvalid`
//! when the document is loaded.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Commit policy that commits after each finished task.
pub const COMMIT_POLICY_PER_TASK: &str = "per_task";
/// Default commit policy for newly authored directives.
pub const COMMIT_POLICY_END_OF_DIRECTIVE: &str = "end_of_directive";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveStatus {
    #[default]
    Todo,
    Open,
    InProgress,
    Blocked,
    Done,
    Archived,
}

impl fmt::Display for DirectiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DirectiveStatus::Todo => "todo",
            DirectiveStatus::Open => "open",
            DirectiveStatus::InProgress => "in_progress",
            DirectiveStatus::Blocked => "blocked",
            DirectiveStatus::Done => "done",
            DirectiveStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Open,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        };
        f.write_str(s)
    }
}

/// Pass/fail outcome of one validation command or of a whole task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn from_success(success: bool) -> Self {
        if success { Verdict::Pass } else { Verdict::Fail }
    }
}

/// UTC timestamp in the documents' `YYYY-MM-DDTHH:MM:SSZ` format.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Lowercase, `-`-joined slug (`"Vendor Table v2"` -> `"vendor-table-v2"`).
pub fn slugify(input: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for c in input.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
