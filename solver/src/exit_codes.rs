//! Stable exit codes for solver CLI commands.

/// Command succeeded (run completed, answer extracted, config valid).
pub const OK: i32 = 0;
/// Invalid input or config, or an internal error.
pub const INVALID: i32 = 1;
/// The run ended `failed`/`error`, or no answer could be extracted.
pub const FAILED: i32 = 2;
/// The run exhausted its time budget.
pub const TIMEOUT: i32 = 3;
