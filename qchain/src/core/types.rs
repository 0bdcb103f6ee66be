//! Shared deterministic types for the chain engine.
//!
//! These are plain value objects. They carry no handles to processes or files
//! and are safe to clone into artifacts and reports.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::state::StepPhase;
use crate::exit_codes;

/// One verification step of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique, filename-safe identifier.
    pub id: String,
    /// Human description (defaults to the id).
    pub desc: String,
    /// Single shell command line, run with `bash -lc` from the repo root.
    pub command: String,
    /// Eligible for local retry with backoff before escalation.
    pub transient: bool,
    /// Paths handed to the repair agent as hints.
    pub hints: Vec<String>,
    /// Per-step wall-clock limit overriding the runner default.
    pub timeout_secs: Option<u64>,
}

impl StepSpec {
    /// Minimal step with defaults for everything but id and command.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            desc: id.clone(),
            id,
            command: command.into(),
            transient: false,
            hints: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }
}

/// Outcome of one execution of a step command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptResult {
    pub step_id: String,
    /// Repair round (1 before any patch, +1 after each applied patch).
    pub round: u32,
    /// Local attempt number within the round (1-indexed).
    pub attempt: u32,
    pub exit_code: i32,
    /// Combined stdout/stderr. Persisted as a separate `.log` file.
    #[serde(skip)]
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Condensed failure report handed to the repair agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSummary {
    pub step_id: String,
    /// Bounded tail of the failing attempt's output.
    pub tail: String,
    /// Rendered report (step id, description, command, tail).
    pub text: String,
}

/// Why a proposal could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProposalFailure {
    /// The sandbox could not be started or driven.
    Sandbox { message: String },
    /// The sandbox job was killed at its deadline.
    TimedOut { timeout_secs: u64 },
    /// The agent exited non-zero or its output is not a diff.
    NotADiff { exit_code: i32 },
}

/// The agent's response to a repair request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchProposal {
    pub step_id: String,
    pub exit_code: i32,
    /// Raw combined sandbox output (or a synthetic error message).
    pub logs: String,
    /// Extracted diff text; present only when the proposal is valid.
    pub diff: Option<String>,
    pub failure: Option<ProposalFailure>,
}

impl PatchProposal {
    pub fn is_valid(&self) -> bool {
        self.diff.is_some()
    }
}

/// Why a run stopped before every step passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    NoValidProposal { failure: ProposalFailure },
    /// A valid proposal was printed but not applied.
    DryRun,
    PatchRejected { exit_code: i32 },
    RepairBudgetExhausted { repairs: u32 },
}

impl AbortReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            AbortReason::DryRun => exit_codes::DRY_RUN_ABORT,
            AbortReason::NoValidProposal { .. }
            | AbortReason::PatchRejected { .. }
            | AbortReason::RepairBudgetExhausted { .. } => exit_codes::FAILED,
        }
    }
}

/// Final state of one step, as recorded in `run.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step_id: String,
    pub phase: StepPhase,
    /// Executions of the step command across all rounds.
    pub executions: u32,
    /// Patches applied to make this step pass.
    pub repairs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Aborted,
}

/// Machine-readable record of one run, written as `run.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub repo: PathBuf,
    pub dry_run: bool,
    pub status: RunStatus,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
}
