//! Directive and task lifecycle engine.
//!
//! A directive is a unit of planned work living in a session directory of
//! JSON documents and executed on its own git branch. This crate moves
//! directives and their tasks through their lifecycle while enforcing write
//! scope, branch, role, and policy invariants.
//!
//! - **[`core`]**: Pure logic (scope prefixes, intersections, invariants,
//!   role gate). No I/O.
//! - **[`io`]**: Side effects (git, config/policy/session files, subprocesses,
//!   metadata validation).
//!
//! Orchestration modules ([`directive`], [`task`], [`runbook`], [`authoring`])
//! combine the two behind an [`engine::Engine`].

pub mod authoring;
pub mod core;
pub mod directive;
pub mod documents;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runbook;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
