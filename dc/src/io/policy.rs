//! Lifecycle policy documents (`core.policy.json`, `executor.lifecycle.policy.json`).
//!
//! Only the consumed shape is modeled; other keys are ignored.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::LifecycleError;

pub const POLICY_KIND: &str = "directive_cli_policy";
pub const CORE_POLICY_FILE: &str = "core.policy.json";
pub const LIFECYCLE_POLICY_FILE: &str = "executor.lifecycle.policy.json";

/// Branch bootstrap mode allowing `directive start` to create a missing branch from its local base.
pub const BOOTSTRAP_FROM_LOCAL_BASE: &str = "create_from_local_base_if_missing_local";

#[derive(Debug, Clone, Deserialize)]
struct PolicyHeader {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    policy_id: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CorePolicyDoc {
    #[serde(default)]
    executor_execution_context: ExecutionContextPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ExecutionContextPolicy {
    #[serde(default)]
    require_handoff_for_execution: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LifecyclePolicyDoc {
    #[serde(default)]
    lifecycle: LifecycleSection,
}

#[derive(Debug, Clone, Deserialize)]
struct LifecycleSection {
    #[serde(default)]
    commit_policy_values: Vec<String>,
    #[serde(default)]
    branch_bootstrap_mode: String,
    #[serde(default)]
    allow_task_status_updates_via_lifecycle: bool,
    #[serde(default = "default_true")]
    allow_task_updated_timestamp_via_lifecycle: bool,
    #[serde(default)]
    auto_push_on_task_finish: bool,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            commit_policy_values: Vec::new(),
            branch_bootstrap_mode: String::new(),
            allow_task_status_updates_via_lifecycle: false,
            allow_task_updated_timestamp_via_lifecycle: true,
            auto_push_on_task_finish: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The lifecycle feature flags consumed by directive and task commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Legal `commit_policy` values; empty advertises no restriction.
    pub commit_policy_values: Vec<String>,
    pub require_handoff: bool,
    pub allow_branch_bootstrap: bool,
    pub allow_task_status_updates: bool,
    pub allow_task_timestamp_updates: bool,
    pub auto_push: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            commit_policy_values: vec!["per_task".to_string(), "end_of_directive".to_string()],
            require_handoff: false,
            allow_branch_bootstrap: true,
            allow_task_status_updates: true,
            allow_task_timestamp_updates: true,
            auto_push: false,
        }
    }
}

/// Load and combine both required policy files from `dir`.
pub fn load_policy(dir: &Path) -> Result<LifecyclePolicy> {
    let core: CorePolicyDoc = load_policy_file(&dir.join(CORE_POLICY_FILE), "core")?;
    let lifecycle: LifecyclePolicyDoc =
        load_policy_file(&dir.join(LIFECYCLE_POLICY_FILE), "executor_lifecycle")?;
    let section = lifecycle.lifecycle;
    let policy = LifecyclePolicy {
        commit_policy_values: section.commit_policy_values,
        require_handoff: core.executor_execution_context.require_handoff_for_execution,
        allow_branch_bootstrap: section.branch_bootstrap_mode.trim() == BOOTSTRAP_FROM_LOCAL_BASE,
        allow_task_status_updates: section.allow_task_status_updates_via_lifecycle,
        allow_task_timestamp_updates: section.allow_task_updated_timestamp_via_lifecycle,
        auto_push: section.auto_push_on_task_finish,
    };
    debug!(?policy, "loaded lifecycle policy");
    Ok(policy)
}

/// Read one policy file, checking its header before decoding the body.
fn load_policy_file<T: DeserializeOwned>(path: &Path, expected_id: &str) -> Result<T> {
    if !path.exists() {
        return Err(LifecycleError::policy(format!(
            "missing required policy file: {}",
            path.display()
        ))
        .into());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| LifecycleError::policy(format!("parse {}: {err}", path.display())))?;
    if !value.is_object() {
        return Err(LifecycleError::policy(format!(
            "policy file must contain a JSON object: {}",
            path.display()
        ))
        .into());
    }
    let header: PolicyHeader = serde_json::from_value(value.clone())
        .map_err(|err| LifecycleError::policy(format!("{}: {err}", path.display())))?;
    if header.kind != POLICY_KIND {
        return Err(
            LifecycleError::policy(format!("invalid policy kind in {}", path.display())).into(),
        );
    }
    if header.version.trim().is_empty() {
        return Err(
            LifecycleError::policy(format!("invalid version in {}", path.display())).into(),
        );
    }
    if header.policy_id != expected_id {
        return Err(LifecycleError::policy(format!(
            "policy id mismatch in {}: expected '{expected_id}', got '{}'",
            path.display(),
            header.policy_id
        ))
        .into());
    }
    serde_json::from_value(value)
        .map_err(|err| LifecycleError::policy(format!("{}: {err}", path.display())).into())
}
