//! Deterministic, pure logic shared by the chain engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod chain;
pub mod proposal;
pub mod retry;
pub mod state;
pub mod summary;
pub mod types;
