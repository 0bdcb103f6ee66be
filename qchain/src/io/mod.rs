//! I/O for the runner: files, processes, the sandbox and git.

pub mod artifacts;
pub mod chain_loader;
pub mod config;
pub mod git;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod step_runner;
