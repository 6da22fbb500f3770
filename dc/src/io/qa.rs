//! Interactive QA gate used by the closeout runbook.

use std::io::{BufRead, IsTerminal, Write};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};

/// Operator verdict on manual QA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaDecision {
    Pass,
    Fail,
    Skip,
}

impl FromStr for QaDecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" | "p" | "y" | "yes" => Ok(QaDecision::Pass),
            "fail" | "f" | "n" | "no" => Ok(QaDecision::Fail),
            "skip" | "s" => Ok(QaDecision::Skip),
            other => Err(anyhow!("unknown QA decision '{other}' (expected pass, fail, or skip)")),
        }
    }
}

/// Source of a QA decision when none was passed on the command line.
pub trait QaPrompt {
    fn ask(&self, session: &str) -> Result<QaDecision>;
}

/// Asks on stdin/stderr; fails fast when stdin is not a terminal.
pub struct TerminalQa;

impl QaPrompt for TerminalQa {
    fn ask(&self, session: &str) -> Result<QaDecision> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Err(anyhow!(
                "QA gate needs a decision but stdin is not a terminal; pass --qa pass|fail|skip"
            ));
        }
        let mut stderr = std::io::stderr();
        write!(stderr, "QA for {session} [pass/fail/skip]: ").context("write QA prompt")?;
        stderr.flush().context("flush QA prompt")?;
        let mut line = String::new();
        stdin
            .lock()
            .read_line(&mut line)
            .context("read QA decision")?;
        line.parse()
    }
}

/// A fixed answer (tests and `--qa`).
pub struct FixedQa(pub QaDecision);

impl QaPrompt for FixedQa {
    fn ask(&self, _session: &str) -> Result<QaDecision> {
        Ok(self.0)
    }
}
