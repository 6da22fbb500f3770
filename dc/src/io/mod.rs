//! Side-effecting collaborators: git, config and policy files, session
//! documents, subprocesses, metadata validation, and operator prompts.

pub mod config;
pub mod git;
pub mod policy;
pub mod process;
pub mod qa;
pub mod session;
pub mod validator;
