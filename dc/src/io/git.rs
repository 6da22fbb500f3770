//! Git adapter for lifecycle commands.
//!
//! Lifecycle safety is derived from git state (clean tree, branch match,
//! ancestry), so every call goes through the small [`VcsGateway`] surface.
//! [`Git`] implements it over `git` subprocesses; tests use an in-memory fake.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::scope::{canonical_prefixes, path_within_prefix};
use crate::error::LifecycleError;

/// Version-control operations the lifecycle engine relies on.
pub trait VcsGateway {
    /// Current branch name (errors on detached HEAD).
    fn current_branch(&self) -> Result<String>;
    fn branch_exists_local(&self, branch: &str) -> Result<bool>;
    fn branch_exists_remote(&self, remote: &str, branch: &str) -> Result<bool>;
    /// Repo-relative paths of every modified, staged, or untracked file.
    fn changed_files(&self) -> Result<Vec<String>>;
    fn short_revision(&self) -> Result<String>;
    /// True iff `candidate` is reachable from the tip of `base`.
    fn is_ancestor(&self, candidate: &str, base: &str) -> Result<bool>;
    fn has_upstream(&self, branch: &str) -> Result<bool>;

    fn checkout(&self, branch: &str) -> Result<()>;
    /// Create `branch` at `start_point` and check it out.
    fn create_branch(&self, branch: &str, start_point: &str) -> Result<()>;
    /// Stage additions, modifications, and deletions under `paths`.
    fn stage(&self, paths: &[String]) -> Result<()>;
    /// Commit staged changes; `Ok(false)` when nothing was staged.
    fn commit(&self, message: &str) -> Result<bool>;
    fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()>;
    /// Delete a local branch (`-D` when `force`, otherwise `-d`).
    fn delete_branch(&self, branch: &str, force: bool) -> Result<()>;
    fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()>;

    /// Ensure the worktree is clean, allowing files under any of the given prefixes.
    fn ensure_clean_except_prefixes(&self, allowed: &[String]) -> Result<()> {
        let allowed = canonical_prefixes(allowed.iter().map(String::as_str));
        let disallowed: Vec<String> = self
            .changed_files()?
            .into_iter()
            .filter(|file| !allowed.iter().any(|prefix| path_within_prefix(file, prefix)))
            .collect();
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        Err(LifecycleError::DirtyWorkingTree { files: disallowed }.into())
    }
}

/// Whether a non-zero git exit is an error or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Non-zero exit raises with captured stderr.
    Raise,
    /// Probe-style call: the caller inspects the exit code.
    Allow,
}

/// Captured output of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Run `git <args>`; with [`FailureMode::Raise`] a non-zero exit is an error
    /// carrying the captured stderr.
    pub fn run_git(&self, args: &[&str], mode: FailureMode) -> Result<GitOutput> {
        let output = self.run(args)?;
        let captured = GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if mode == FailureMode::Raise && !captured.success() {
            let detail = if captured.stderr.trim().is_empty() {
                captured.stdout.trim()
            } else {
                captured.stderr.trim()
            };
            return Err(anyhow!("git {} failed: {}", args.join(" "), detail));
        }
        Ok(captured)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["-c", "core.quotepath=off", "status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    fn ref_exists(&self, full_ref: &str) -> Result<bool> {
        let out = self.run_git(&["show-ref", "--verify", "--quiet", full_ref], FailureMode::Allow)?;
        Ok(out.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.run_git(args, FailureMode::Raise)?.stdout)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VcsGateway for Git {
    #[instrument(skip_all)]
    fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    fn branch_exists_local(&self, branch: &str) -> Result<bool> {
        self.ref_exists(&format!("refs/heads/{branch}"))
    }

    fn branch_exists_remote(&self, remote: &str, branch: &str) -> Result<bool> {
        self.ref_exists(&format!("refs/remotes/{remote}/{branch}"))
    }

    fn changed_files(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    fn short_revision(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--short", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip_all, fields(candidate, base))]
    fn is_ancestor(&self, candidate: &str, base: &str) -> Result<bool> {
        let out = self.run_git(
            &["merge-base", "--is-ancestor", candidate, base],
            FailureMode::Allow,
        )?;
        match out.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {candidate} {base} failed: {}",
                out.stderr.trim()
            )),
        }
    }

    fn has_upstream(&self, branch: &str) -> Result<bool> {
        let spec = format!("{branch}@{{upstream}}");
        let out = self.run_git(
            &["rev-parse", "--abbrev-ref", "--symbolic-full-name", &spec],
            FailureMode::Allow,
        )?;
        Ok(out.success())
    }

    #[instrument(skip_all, fields(branch))]
    fn checkout(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_git(&["checkout", branch], FailureMode::Raise)?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch, start_point))]
    fn create_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "creating and checking out new branch");
        self.run_git(&["checkout", "-b", branch, start_point], FailureMode::Raise)?;
        Ok(())
    }

    fn stage(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_git(&args, FailureMode::Raise)?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn commit(&self, message: &str) -> Result<bool> {
        let staged = self.run_git(&["diff", "--cached", "--name-only"], FailureMode::Raise)?;
        if staged.stdout.trim().is_empty() {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_git(&["commit", "-m", message], FailureMode::Raise)?;
        Ok(true)
    }

    #[instrument(skip_all, fields(branch))]
    fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        self.run_git(&["merge", "--no-ff", branch, "-m", message], FailureMode::Raise)?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch, force))]
    fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_git(&["branch", flag, branch], FailureMode::Raise)?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote, branch, set_upstream))]
    fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()> {
        let mut args = vec!["push"];
        if set_upstream {
            args.push("-u");
        }
        args.extend([remote, branch]);
        self.run_git(&args, FailureMode::Raise)?;
        Ok(())
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Undo git's C-style path quoting (`"a\tb"`, `"caf\303\251"`).
fn unquote(path: &str) -> String {
    let Some(inner) = path.strip_prefix('"').and_then(|p| p.strip_suffix('"')) else {
        return path.to_string();
    };
    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => bytes.push(b'\n'),
            Some('t') => bytes.push(b'\t'),
            Some('r') => bytes.push(b'\r'),
            Some('a') => bytes.push(0x07),
            Some('b') => bytes.push(0x08),
            Some('f') => bytes.push(0x0c),
            Some('v') => bytes.push(0x0b),
            Some(d @ '0'..='7') => {
                let mut value = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|next| next.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                bytes.push((value & 0xff) as u8);
            }
            Some(other) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => bytes.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn parses_quoted_path() {
        let e = parse_status_line("?? \"with space.txt\"").expect("parse");
        assert_eq!(e.path, "with space.txt");
    }

    #[test]
    fn decodes_escaped_quoted_paths() {
        let e = parse_status_line(r#"?? "apps/caf\303\251/menu.md""#).expect("parse");
        assert_eq!(e.path, "apps/café/menu.md");
        let e = parse_status_line(r#" M "tab\there \"q\".txt""#).expect("parse");
        assert_eq!(e.path, "tab\there \"q\".txt");
        let e = parse_status_line(r#"R  "old\\a.txt" -> "new\\b.txt""#).expect("parse");
        assert_eq!(e.path, "new\\b.txt");
    }

    #[test]
    fn non_ascii_paths_match_scope_prefixes() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        repo.write_file("apps/café/menu.md", "x\n").expect("write");
        assert_eq!(
            git.changed_files().expect("status"),
            vec!["apps/café/menu.md".to_string()]
        );
        git.ensure_clean_except_prefixes(&["apps/café".to_string()])
            .expect("allowed");
    }

    #[test]
    fn ancestry_probe_distinguishes_merged_and_diverged() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        git.create_branch("feat/a", "dev").expect("branch");
        repo.commit_file("a.txt", "a\n", "feat: a").expect("commit a");
        assert!(git.is_ancestor("dev", "feat/a").expect("probe"));
        assert!(!git.is_ancestor("feat/a", "dev").expect("probe"));

        git.checkout("dev").expect("checkout dev");
        git.merge_no_ff("feat/a", "merge feat/a").expect("merge");
        assert!(git.is_ancestor("feat/a", "dev").expect("probe"));
        assert!(git.is_ancestor("no-such-ref", "dev").is_err());
    }

    #[test]
    fn clean_check_honors_allowed_prefixes() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        repo.write_file(".runbook/session-logs/today.log", "log\n")
            .expect("write log");
        git.ensure_clean_except_prefixes(&[".runbook/session-logs/".to_string()])
            .expect("allowed");

        repo.write_file("notes.txt", "x\n").expect("write notes");
        let err = git
            .ensure_clean_except_prefixes(&[".runbook/session-logs".to_string()])
            .expect_err("dirty");
        match err.downcast_ref::<LifecycleError>() {
            Some(LifecycleError::DirtyWorkingTree { files }) => {
                assert_eq!(files, &vec!["notes.txt".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn commit_without_staged_changes_is_noop() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        assert!(!git.commit("nothing").expect("commit"));
        repo.write_file("x.txt", "x\n").expect("write");
        git.stage(&["x.txt".to_string()]).expect("stage");
        assert!(git.commit("add x").expect("commit"));
        assert!(git.changed_files().expect("status").is_empty());
    }
}
