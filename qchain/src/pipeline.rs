//! Pipeline driver: runs the chain step by step through the per-step state
//! machine in [`crate::core::state`].
//!
//! Each step runs locally, retries with backoff when transient, and otherwise
//! escalates to the repair agent. An applied patch starts a new round for the
//! same step with the attempt counter reset. Any abort ends the run.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::context::RunContext;
use crate::core::chain::ChainSpec;
use crate::core::proposal::touched_paths;
use crate::core::retry::{Decision, decide};
use crate::core::state::{StepPhase, can_transition};
use crate::core::summary::summarize_failure;
use crate::core::types::{
    AbortReason, AttemptResult, ProposalFailure, RunStatus, RunSummary, StepReport, StepSpec,
};
use crate::exit_codes;
use crate::io::git::PatchApplier;
use crate::io::sandbox::{JobBackend, SandboxRunner};
use crate::io::step_runner::{StepRequest, StepRunner};
use crate::repair::{RepairRequest, propose_fix};

/// Blocking wait between local retries.
pub trait Sleeper {
    fn sleep(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        thread::sleep(delay);
    }
}

/// Everything the driver talks to besides the filesystem.
#[derive(Debug)]
pub struct Collaborators<'a, S, B, A, Z> {
    pub steps: &'a S,
    pub sandbox: &'a SandboxRunner<B>,
    pub applier: &'a A,
    pub sleeper: &'a Z,
}

/// Why the run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// Every step passed.
    Completed,
    Aborted { step_id: String, reason: AbortReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    /// One entry per chain step, including steps that never started.
    pub steps: Vec<StepReport>,
    pub stop: RunStop,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match &self.stop {
            RunStop::Completed => exit_codes::OK,
            RunStop::Aborted { reason, .. } => reason.exit_code(),
        }
    }
}

/// Tracks one step's phase and rejects transitions the state machine lacks.
struct PhaseTracker<'a> {
    step_id: &'a str,
    phase: StepPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(step_id: &'a str) -> Self {
        Self {
            step_id,
            phase: StepPhase::Pending,
        }
    }

    fn advance(&mut self, to: StepPhase) -> Result<()> {
        if !can_transition(self.phase, to) {
            return Err(anyhow!(
                "step '{}': illegal transition {} -> {}",
                self.step_id,
                self.phase.as_str(),
                to.as_str()
            ));
        }
        debug!(step = self.step_id, from = self.phase.as_str(), to = to.as_str(), "phase");
        self.phase = to;
        Ok(())
    }

    fn finish(&self, executions: u32, repairs: u32, abort: Option<AbortReason>) -> StepRun {
        StepRun {
            report: StepReport {
                step_id: self.step_id.to_string(),
                phase: self.phase,
                executions,
                repairs,
            },
            abort,
        }
    }
}

struct StepRun {
    report: StepReport,
    abort: Option<AbortReason>,
}

/// Run every step of `chain` in order and write `run.json`.
///
/// Aborts are part of the outcome; `Err` means the runner itself failed
/// (spawning a step, writing an artifact, rendering the prompt).
#[instrument(skip_all, fields(run_id = %ctx.run_id(), steps = chain.len()))]
pub fn run_chain<S, B, A, Z>(
    ctx: &RunContext,
    chain: &ChainSpec,
    deps: &Collaborators<'_, S, B, A, Z>,
) -> Result<RunOutcome>
where
    S: StepRunner,
    B: JobBackend,
    A: PatchApplier,
    Z: Sleeper,
{
    let started_at = Utc::now();
    let total = chain.len();
    let mut reports: Vec<StepReport> = chain
        .steps()
        .iter()
        .map(|step| StepReport {
            step_id: step.id.clone(),
            phase: StepPhase::Pending,
            executions: 0,
            repairs: 0,
        })
        .collect();

    let mut stop = RunStop::Completed;
    for (idx, step) in chain.steps().iter().enumerate() {
        println!("\n== [{}/{}] {}: {} ==", idx + 1, total, step.id, step.desc);
        let run = run_step(ctx, step, deps)?;
        reports[idx] = run.report;
        if let Some(reason) = run.abort {
            stop = RunStop::Aborted {
                step_id: step.id.clone(),
                reason,
            };
            break;
        }
    }

    let outcome = RunOutcome {
        run_id: ctx.run_id().to_string(),
        run_dir: ctx.run_dir.path().to_path_buf(),
        steps: reports,
        stop,
    };
    let (status, aborted_step, abort_reason) = match &outcome.stop {
        RunStop::Completed => (RunStatus::Passed, None, None),
        RunStop::Aborted { step_id, reason } => {
            (RunStatus::Aborted, Some(step_id.clone()), Some(reason.clone()))
        }
    };
    ctx.run_dir.write_run_summary(&RunSummary {
        run_id: outcome.run_id.clone(),
        repo: ctx.repo_root.clone(),
        dry_run: ctx.dry_run,
        status,
        exit_code: outcome.exit_code(),
        aborted_step,
        abort_reason,
        started_at,
        ended_at: Utc::now(),
        steps: outcome.steps.clone(),
    })?;

    if outcome.stop == RunStop::Completed {
        println!("\nAll steps passed. Artifacts in {}", outcome.run_dir.display());
    }
    info!(exit_code = outcome.exit_code(), "run finished");
    Ok(outcome)
}

#[instrument(skip_all, fields(step = %step.id))]
fn run_step<S, B, A, Z>(
    ctx: &RunContext,
    step: &StepSpec,
    deps: &Collaborators<'_, S, B, A, Z>,
) -> Result<StepRun>
where
    S: StepRunner,
    B: JobBackend,
    A: PatchApplier,
    Z: Sleeper,
{
    let mut phase = PhaseTracker::new(&step.id);
    let mut round = 1u32;
    let mut attempt = 1u32;
    let mut executions = 0u32;
    let mut repairs = 0u32;

    phase.advance(StepPhase::Running)?;
    loop {
        let started_at = Utc::now();
        let clock = Instant::now();
        let execution = deps.steps.run(&StepRequest {
            step_id: step.id.clone(),
            command: step.command.clone(),
            workdir: ctx.repo_root.clone(),
            round,
            attempt,
            timeout: ctx.step_timeout(step),
        })?;
        executions += 1;

        let result = AttemptResult {
            step_id: step.id.clone(),
            round,
            attempt,
            exit_code: execution.exit_code,
            output: execution.output,
            started_at,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            timed_out: execution.timed_out,
        };
        // Persist before deciding.
        ctx.run_dir.write_attempt(&result)?;
        debug!(round, attempt, exit_code = result.exit_code, "attempt recorded");

        match decide(step, attempt, result.exit_code, &ctx.retry) {
            Decision::Succeed => {
                phase.advance(StepPhase::Success)?;
                return Ok(phase.finish(executions, repairs, None));
            }
            Decision::Retry {
                next_attempt,
                delay,
            } => {
                phase.advance(StepPhase::RetryWait)?;
                println!(
                    "Transient failure, retrying in {:.1}s (attempt {}/{})",
                    delay.as_secs_f64(),
                    next_attempt,
                    ctx.retry.max_attempts
                );
                deps.sleeper.sleep(delay);
                attempt = next_attempt;
                phase.advance(StepPhase::Running)?;
            }
            Decision::Escalate => {
                phase.advance(StepPhase::Escalate)?;
                let summary = summarize_failure(step, &result.output);
                ctx.run_dir.write_summary(&step.id, round, &summary.text)?;
                println!("\n-- Failure summary --\n{}", summary.text);

                if repairs >= ctx.max_repairs {
                    println!(
                        "Repair budget exhausted for step '{}' after {} patch(es). Aborting.",
                        step.id, repairs
                    );
                    phase.advance(StepPhase::Abort)?;
                    let reason = AbortReason::RepairBudgetExhausted { repairs };
                    return Ok(phase.finish(executions, repairs, Some(reason)));
                }

                phase.advance(StepPhase::Repairing)?;
                println!("-- Asking the repair agent for a fix (diff) --");
                let job_dir = ctx.run_dir.create_job_dir(&step.id, round)?;
                let proposal = propose_fix(
                    ctx,
                    deps.sandbox,
                    &RepairRequest {
                        step,
                        round,
                        summary: &summary,
                        job_dir: &job_dir,
                    },
                )?;
                ctx.run_dir
                    .write_agent_output(&step.id, round, &proposal.logs)?;

                let Some(diff) = proposal.diff.as_deref() else {
                    println!("{}", proposal.logs.trim_end());
                    println!("Repair agent did not return a valid diff. Aborting.");
                    phase.advance(StepPhase::Abort)?;
                    let failure = proposal.failure.clone().unwrap_or(ProposalFailure::NotADiff {
                        exit_code: proposal.exit_code,
                    });
                    let reason = AbortReason::NoValidProposal { failure };
                    return Ok(phase.finish(executions, repairs, Some(reason)));
                };

                println!("\n-- Proposed diff --\n{}", diff.trim_end());
                println!("Touches: {}", touched_paths(diff).join(", "));
                if ctx.dry_run {
                    println!("Dry-run mode: not applying diff. Aborting after printing proposal.");
                    phase.advance(StepPhase::Abort)?;
                    return Ok(phase.finish(executions, repairs, Some(AbortReason::DryRun)));
                }

                let applied = deps.applier.apply(&ctx.repo_root, diff)?;
                println!("git apply rc={}", applied.exit_code);
                if !applied.applied() {
                    if !applied.stderr.is_empty() {
                        eprintln!("{}", applied.stderr);
                    }
                    println!("Patch could not be applied. Aborting.");
                    phase.advance(StepPhase::Abort)?;
                    let reason = AbortReason::PatchRejected {
                        exit_code: applied.exit_code,
                    };
                    return Ok(phase.finish(executions, repairs, Some(reason)));
                }

                ctx.run_dir.write_applied_diff(&step.id, round, diff)?;
                phase.advance(StepPhase::PatchApplied)?;
                repairs += 1;
                round += 1;
                attempt = 1;
                println!("-- Re-running failed step after patch --");
                phase.advance(StepPhase::Running)?;
            }
        }
    }
}
