//! Per-step state machine.
//!
//! ```text
//! PENDING -> RUNNING -> {SUCCESS | RETRY_WAIT | ESCALATE}
//! RETRY_WAIT -> RUNNING
//! ESCALATE -> REPAIRING -> {PATCH_APPLIED | ABORT}
//! PATCH_APPLIED -> RUNNING
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Pending,
    Running,
    RetryWait,
    Escalate,
    Repairing,
    PatchApplied,
    Success,
    Abort,
}

impl StepPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepPhase::Success | StepPhase::Abort)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepPhase::Pending => "pending",
            StepPhase::Running => "running",
            StepPhase::RetryWait => "retry_wait",
            StepPhase::Escalate => "escalate",
            StepPhase::Repairing => "repairing",
            StepPhase::PatchApplied => "patch_applied",
            StepPhase::Success => "success",
            StepPhase::Abort => "abort",
        }
    }
}

/// True if `from -> to` is an edge of the step state machine.
///
/// `Escalate -> Abort` covers an exhausted repair budget, where the agent is
/// never contacted.
pub fn can_transition(from: StepPhase, to: StepPhase) -> bool {
    use StepPhase::{
        Abort, Escalate, Pending, PatchApplied, Repairing, RetryWait, Running, Success,
    };
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Success | RetryWait | Escalate)
            | (RetryWait, Running)
            | (Escalate, Repairing | Abort)
            | (Repairing, PatchApplied | Abort)
            | (PatchApplied, Running)
    )
}
