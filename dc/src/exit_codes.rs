//! Stable exit codes for `dc` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Any failure: precondition, policy, validation, or an interrupted mutation.
pub const FAILED: i32 = 1;
