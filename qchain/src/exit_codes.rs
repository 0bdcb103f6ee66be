//! Stable exit codes for the `qchain` CLI.

/// Every step passed.
pub const OK: i32 = 0;
/// Patch not applied, no valid proposal, repair budget exhausted, or any
/// other runtime error.
pub const FAILED: i32 = 1;
/// The chain file does not exist.
pub const CHAIN_NOT_FOUND: i32 = 2;
/// Dry run stopped after printing a valid proposal.
pub const DRY_RUN_ABORT: i32 = 3;
