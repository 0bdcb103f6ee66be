//! Patch proposal protocol: ask the sandboxed agent for a diff.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::context::RunContext;
use crate::core::proposal::{proposal_from_output, touched_paths};
use crate::core::types::{FailureSummary, PatchProposal, ProposalFailure, StepSpec};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::sandbox::{
    JobBackend, SandboxError, SandboxJobSpec, SandboxOutcome, SandboxRunner, VolumeMount,
};

/// One escalation handed to the agent.
#[derive(Debug, Clone, Copy)]
pub struct RepairRequest<'a> {
    pub step: &'a StepSpec,
    pub round: u32,
    pub summary: &'a FailureSummary,
    /// Per-escalation directory, mounted read-write at `<workdir>/job`.
    pub job_dir: &'a Path,
}

/// Sandbox paths of the two mounts below the configured workdir.
pub fn sandbox_mounts(workdir: &str) -> (String, String) {
    let base = workdir.trim_end_matches('/');
    (format!("{base}/job"), format!("{base}/repo"))
}

/// Build the sandbox job for a repair request. `prompt` goes to stdin.
pub fn repair_job_spec(
    ctx: &RunContext,
    request: &RepairRequest<'_>,
    prompt: String,
) -> Result<SandboxJobSpec, SandboxError> {
    let sandbox = &ctx.config.sandbox;
    let name = format!(
        "qchain-{}-{}-{}-r{}",
        std::process::id(),
        ctx.run_id(),
        request.step.id,
        request.round
    );
    let mut spec = SandboxJobSpec::new(
        name,
        sandbox.image.clone(),
        sandbox.command.clone(),
        Duration::from_secs(sandbox.timeout_secs),
    )?;
    let (job_mount, repo_mount) = sandbox_mounts(&sandbox.workdir);
    spec.entrypoint = sandbox.entrypoint.clone();
    spec.workdir = sandbox.workdir.clone();
    spec.user = sandbox.user.clone();
    spec.env = ctx.sandbox_env.clone();
    spec.limits.memory = sandbox.memory.clone();
    spec.limits.cpus = sandbox.cpus;
    spec.limits.pids_limit = sandbox.pids_limit;
    spec.network = sandbox.network.clone();
    spec.labels = sandbox.labels.clone();
    spec.mounts = vec![
        VolumeMount {
            host_path: request.job_dir.to_path_buf(),
            sandbox_path: job_mount,
            read_only: false,
        },
        VolumeMount {
            host_path: ctx.repo_root.clone(),
            sandbox_path: repo_mount,
            read_only: true,
        },
    ];
    spec.stdin = Some(prompt);
    spec.validate()?;
    Ok(spec)
}

/// Render the prompt, run the agent, and classify its answer.
///
/// Sandbox timeouts and infrastructure failures come back as invalid
/// proposals; only prompt rendering problems are errors.
#[instrument(skip_all, fields(step = %request.step.id, round = request.round))]
pub fn propose_fix<B: JobBackend>(
    ctx: &RunContext,
    sandbox: &SandboxRunner<B>,
    request: &RepairRequest<'_>,
) -> Result<PatchProposal> {
    let repo_path = ctx.repo_root.display().to_string();
    let (_, repo_mount) = sandbox_mounts(&ctx.config.sandbox.workdir);
    let prompt = PromptBuilder::new(ctx.config.prompt_budget_bytes).build(&PromptInputs {
        repo_path: &repo_path,
        repo_mount: &repo_mount,
        summary: &request.summary.text,
        hints: &request.step.hints,
    })?;

    let outcome = match repair_job_spec(ctx, request, prompt.content) {
        Ok(spec) => sandbox.run(&spec),
        Err(err) => SandboxOutcome::InfraError(err),
    };

    let step_id = request.step.id.as_str();
    let failure = match &outcome {
        SandboxOutcome::Completed(_) => None,
        SandboxOutcome::TimedOut { timeout } => Some(ProposalFailure::TimedOut {
            timeout_secs: timeout.as_secs(),
        }),
        SandboxOutcome::InfraError(err) => Some(ProposalFailure::Sandbox {
            message: err.to_string(),
        }),
    };
    let proposal = match (outcome, failure) {
        (SandboxOutcome::Completed(result), _) => {
            info!(
                exit_code = result.exit_code,
                duration_ms = result.duration.as_millis() as u64,
                "repair agent finished"
            );
            proposal_from_output(step_id, result.exit_code, result.logs)
        }
        (outcome, failure) => {
            let (exit_code, logs) = outcome.into_exit_code_and_logs();
            PatchProposal {
                step_id: step_id.to_string(),
                exit_code,
                logs,
                diff: None,
                failure,
            }
        }
    };

    match &proposal.diff {
        Some(diff) => info!(paths = ?touched_paths(diff), "agent proposed a diff"),
        None => warn!(exit_code = proposal.exit_code, "agent returned no usable diff"),
    }
    Ok(proposal)
}
