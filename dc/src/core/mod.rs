//! Deterministic, pure logic shared by the lifecycle engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod capability;
pub mod invariants;
pub mod scope;
pub mod types;
