//! Strict metadata validation of session documents.
//!
//! Lifecycle commands call a [`MetadataValidator`] as their final gate. The
//! default is [`SchemaValidator`] (embedded JSON schemas plus file naming
//! rules); a repo may instead configure an external [`CommandValidator`].

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::slugify;
use crate::documents::{HANDOFF_SUFFIX, META_SUFFIX, TASK_SUFFIX};
use crate::error::LifecycleError;
use crate::io::process::run_command_with_timeout;

const META_SCHEMA: &str = include_str!("../../schemas/directives/meta.v1.schema.json");
const TASK_SCHEMA: &str = include_str!("../../schemas/directives/task.v1.schema.json");
const HANDOFF_SCHEMA: &str = include_str!("../../schemas/directives/handoff.v1.schema.json");

/// Validates repo-relative session files; any problem is `MetadataInvalid`.
pub trait MetadataValidator {
    fn validate(&self, root: &Path, files: &[String]) -> Result<()>;
}

/// In-process validator backed by the embedded schemas.
pub struct SchemaValidator {
    meta: Validator,
    task: Validator,
    handoff: Validator,
}

impl SchemaValidator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            meta: compile(META_SCHEMA).context("compile meta schema")?,
            task: compile(TASK_SCHEMA).context("compile task schema")?,
            handoff: compile(HANDOFF_SCHEMA).context("compile handoff schema")?,
        })
    }

    fn check_file(&self, root: &Path, rel: &str) -> Vec<String> {
        let path = root.join(rel);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (validator, suffix) = if name.ends_with(META_SUFFIX) {
            (&self.meta, META_SUFFIX)
        } else if name.ends_with(TASK_SUFFIX) {
            (&self.task, TASK_SUFFIX)
        } else if name.ends_with(HANDOFF_SUFFIX) {
            (&self.handoff, HANDOFF_SUFFIX)
        } else {
            return vec![format!("{rel}: not a directive document")];
        };

        let mut issues = Vec::new();
        let stem = name.trim_end_matches(suffix);
        if stem.is_empty() || slugify(stem) != stem {
            issues.push(format!("{rel}: file name must be <slug>{suffix}"));
        }

        let value = match read_value(&path) {
            Ok(value) => value,
            Err(err) => {
                issues.push(format!("{rel}: {err:#}"));
                return issues;
            }
        };
        issues.extend(
            validator
                .iter_errors(&value)
                .map(|err| format!("{rel}: {err}")),
        );
        if suffix == META_SUFFIX
            && let Some(slug) = value
                .pointer("/meta/directive_slug")
                .and_then(Value::as_str)
            && slug != stem
        {
            issues.push(format!(
                "{rel}: meta.directive_slug '{slug}' does not match file name"
            ));
        }
        issues
    }
}

impl MetadataValidator for SchemaValidator {
    #[instrument(skip_all, fields(files = files.len()))]
    fn validate(&self, root: &Path, files: &[String]) -> Result<()> {
        let issues: Vec<String> = files
            .iter()
            .flat_map(|rel| self.check_file(root, rel))
            .collect();
        if issues.is_empty() {
            debug!("metadata validation passed");
            return Ok(());
        }
        Err(LifecycleError::metadata(format!(
            "metadata validation failed:\n- {}",
            issues.join("\n- ")
        ))
        .into())
    }
}

/// External validator invoked as `<command...> --strict --file <rel>...` from the repo root.
pub struct CommandValidator {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandValidator {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl MetadataValidator for CommandValidator {
    #[instrument(skip_all, fields(files = files.len()))]
    fn validate(&self, root: &Path, files: &[String]) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("validator.command must be a non-empty array"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg("--strict").current_dir(root);
        for file in files {
            cmd.arg("--file").arg(file);
        }
        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run metadata validator {program}"))?;
        if output.status.success() && !output.timed_out {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        Err(LifecycleError::metadata(format!(
            "strict metadata validation failed ({}): {detail}",
            if output.timed_out {
                "timed out".to_string()
            } else {
                format!("exit {:?}", output.status.code())
            }
        ))
        .into())
    }
}

fn compile(schema: &str) -> Result<Validator> {
    let value: Value = serde_json::from_str(schema).context("parse schema json")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&value)
        .map_err(|err| anyhow!("invalid schema: {err}"))
}

fn read_value(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).context("parse json")?;
    if !value.is_object() {
        return Err(anyhow!("JSON root must be an object"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SessionFixture;

    #[test]
    fn fixture_session_passes() {
        let fx = SessionFixture::new("vendor-table").expect("fixture");
        fx.add_task("build-table", &["apps/web/app/vendors"], &["true"])
            .expect("task");
        fx.add_handoff("feat/vendor-table", &[]).expect("handoff");
        let session = fx.session().expect("session");
        let files = session.artifact_files().expect("files");
        assert_eq!(files.len(), 3);

        let validator = SchemaValidator::new().expect("validator");
        validator.validate(fx.root(), &files).expect("valid");
    }

    #[test]
    fn reports_every_problem_as_metadata_invalid() {
        let fx = SessionFixture::new("vendor-table").expect("fixture");
        let task = fx.add_task("no-commands", &["apps"], &[]).expect("task");
        let session = fx.session().expect("session");
        let mut doc = session.doc.clone();
        doc.meta.directive_slug = "other-slug".to_string();
        crate::io::session::write_json(&session.meta_path, &doc).expect("write meta");

        let files = vec![session.meta_rel(), session.rel_path(&task)];
        let err = SchemaValidator::new()
            .expect("validator")
            .validate(fx.root(), &files)
            .expect_err("invalid");
        let Some(LifecycleError::MetadataInvalid(msg)) = err.downcast_ref::<LifecycleError>() else {
            panic!("unexpected error: {err:#}");
        };
        assert!(msg.contains("does not match file name"), "{msg}");
        assert!(msg.contains("no-commands.task.json"), "{msg}");
    }

    #[test]
    fn malformed_json_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("x.task.json"), "{ nope").expect("write");
        let err = SchemaValidator::new()
            .expect("validator")
            .validate(temp.path(), &["x.task.json".to_string()])
            .expect_err("invalid");
        assert!(err.to_string().contains("x.task.json"));
    }

    #[test]
    fn command_validator_uses_exit_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = vec!["a.meta.json".to_string()];
        let ok = CommandValidator::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            Duration::from_secs(10),
            1024,
        );
        ok.validate(temp.path(), &files).expect("pass");

        let failing = CommandValidator::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo broken >&2; exit 1".to_string(),
            ],
            Duration::from_secs(10),
            1024,
        );
        let err = failing.validate(temp.path(), &files).expect_err("fail");
        assert!(err.to_string().contains("broken"));
    }
}
