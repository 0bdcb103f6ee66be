//! Self-healing quality chain runner.
//!
//! Runs an ordered chain of verification commands against a repository.
//! Transient failures are retried locally with exponential backoff; persistent
//! failures are escalated to a sandboxed repair agent whose unified diff is
//! applied atomically before the failing step runs again. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (chain validation, retry decisions,
//!   failure summaries, proposal classification, the step state machine).
//! - **[`io`]**: Side-effecting operations (chain loading, processes, the
//!   sandbox, git, artifacts). Behind traits where tests substitute fakes.
//!
//! Orchestration modules ([`pipeline`], [`repair`]) coordinate core logic with
//! I/O to implement the CLI.

pub mod context;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod repair;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
