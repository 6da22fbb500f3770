//! Repository configuration stored under `.directive-cli/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::process::ShellOptions;

/// Config path relative to the repository root.
pub const CONFIG_REL_PATH: &str = ".directive-cli/config.toml";

/// Lifecycle configuration (TOML).
///
/// Edited by humans; every field is optional and defaults to the layout the
/// directive tooling ships with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DcConfig {
    /// Directory holding one sub-directory per directive session.
    pub directives_root: String,

    /// Directory holding `core.policy.json` and `executor.lifecycle.policy.json`.
    pub policy_dir: String,

    /// Remote used for ancestry fallbacks and auto-push.
    pub remote: String,

    /// Branches `directive cleanup` never deletes (the base branch is always added).
    pub protected_branches: Vec<String>,

    /// Infrastructure prefixes that never make the worktree dirty.
    pub always_allowed_prefixes: Vec<String>,

    pub validation: ValidationConfig,

    pub validator: ValidatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Per-command wall-clock limit for task validation commands.
    pub timeout_secs: u64,
    /// Captured stdout/stderr beyond this many bytes is dropped.
    pub output_limit_bytes: usize,
    /// Shell used to run each validation line.
    pub shell: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            shell: vec!["bash".to_string(), "-lc".to_string()],
        }
    }
}

/// External metadata validator. Empty `command` selects the built-in schema validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidatorConfig {
    pub command: Vec<String>,
}

impl Default for DcConfig {
    fn default() -> Self {
        Self {
            directives_root: "apps/web/.local/directives".to_string(),
            policy_dir: ".directive-cli/policies".to_string(),
            remote: "origin".to_string(),
            protected_branches: vec!["dev".to_string()],
            always_allowed_prefixes: [
                ".runbook/codex-logs",
                ".runbook/session-logs",
                ".runbook/pending",
                ".directive-cli/cache",
                ".turbo",
                "node_modules/.cache",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            validation: ValidationConfig::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

impl DcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.directives_root.trim().is_empty() {
            return Err(anyhow!("directives_root must be non-empty"));
        }
        if Path::new(&self.directives_root).is_absolute() {
            return Err(anyhow!("directives_root must be repo-relative"));
        }
        if self.policy_dir.trim().is_empty() {
            return Err(anyhow!("policy_dir must be non-empty"));
        }
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must be non-empty"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        if self.validation.output_limit_bytes == 0 {
            return Err(anyhow!("validation.output_limit_bytes must be > 0"));
        }
        if self.validation.shell.is_empty() || self.validation.shell[0].trim().is_empty() {
            return Err(anyhow!("validation.shell must be a non-empty array"));
        }
        if !self.validator.command.is_empty() && self.validator.command[0].trim().is_empty() {
            return Err(anyhow!("validator.command must start with a program"));
        }
        Ok(())
    }

    pub fn directives_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.directives_root)
    }

    pub fn policy_path(&self, root: &Path) -> PathBuf {
        root.join(&self.policy_dir)
    }

    pub fn shell_options(&self) -> ShellOptions {
        ShellOptions {
            shell: self.validation.shell.clone(),
            timeout: Duration::from_secs(self.validation.timeout_secs),
            output_limit_bytes: self.validation.output_limit_bytes,
        }
    }
}

/// Load `<root>/.directive-cli/config.toml`.
///
/// If the file is missing, returns `DcConfig::default()`.
pub fn load_config(root: &Path) -> Result<DcConfig> {
    let path = root.join(CONFIG_REL_PATH);
    if !path.exists() {
        let cfg = DcConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DcConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
