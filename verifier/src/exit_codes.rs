//! Stable exit codes for the verifier CLI.

/// Run completed and every repository and candidate was processed.
pub const OK: i32 = 0;
/// Invalid configuration or credentials; nothing was run.
pub const INVALID: i32 = 1;
/// Run completed but some repositories or candidates failed.
pub const PARTIAL: i32 = 2;
