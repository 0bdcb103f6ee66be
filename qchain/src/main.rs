//! Self-healing quality chain runner.
//!
//! Runs the steps of a chain file against a repository, retries transient
//! failures, and asks a sandboxed agent for a patch when a step keeps failing.
//! Exit codes are listed in [`qchain::exit_codes`].

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

use qchain::context::{RunContext, RunOptions};
use qchain::exit_codes;
use qchain::io::artifacts::RunDir;
use qchain::io::chain_loader::{ChainConfigError, load_chain};
use qchain::io::config::{RunnerConfig, load_config};
use qchain::io::git::GitPatchApplier;
use qchain::io::sandbox::SandboxRunner;
use qchain::io::sandbox::docker::DockerBackend;
use qchain::io::step_runner::ShellStepRunner;
use qchain::logging;
use qchain::pipeline::{Collaborators, ThreadSleeper, run_chain};

#[derive(Parser)]
#[command(
    name = "qchain",
    version,
    about = "Run a quality chain and repair failing steps with a sandboxed agent"
)]
struct Cli {
    /// Chain definition (YAML).
    #[arg(long, default_value = "chains/quality.yaml")]
    chain: PathBuf,

    /// Repository to check and patch. Defaults to the current directory.
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Print the agent's proposal but never apply it.
    #[arg(long)]
    dry_run: bool,

    /// Local executions of a transient step before escalating.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Base of the exponential backoff between local retries, in seconds.
    #[arg(long, default_value_t = 2.0)]
    backoff: f64,

    /// Where run directories are created.
    #[arg(long, default_value = "runs")]
    runs_dir: PathBuf,

    /// Patches that may be applied to one step before giving up.
    #[arg(long, default_value_t = 3)]
    max_repairs: u32,

    /// Runner configuration (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let chain = match load_chain(&cli.chain) {
        Ok(chain) => chain,
        Err(ChainConfigError::NotFound(path)) => {
            eprintln!("Chain file not found: {}", path.display());
            return Ok(exit_codes::CHAIN_NOT_FOUND);
        }
        Err(err) => return Err(err.into()),
    };

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RunnerConfig::default(),
    };
    let options = RunOptions {
        dry_run: cli.dry_run,
        max_attempts: cli.max_attempts,
        base_backoff_secs: cli.backoff,
        max_repairs: cli.max_repairs,
    };
    options.validate()?;
    let repo = match cli.repo {
        Some(repo) => repo,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    // Fail before creating a run directory for a repo that is not there.
    let repo = repo
        .canonicalize()
        .with_context(|| format!("resolve repo {}", repo.display()))?;

    let run_dir = RunDir::create(&cli.runs_dir, Utc::now())?;
    let ctx = RunContext::new(&repo, run_dir, options, config)?;
    println!(
        "Run {} on {} (artifacts in {})",
        ctx.run_id(),
        ctx.repo_root.display(),
        ctx.run_dir.path().display()
    );

    let steps = ShellStepRunner::new(ctx.config.step_output_limit_bytes);
    let sandbox = SandboxRunner::new(DockerBackend::default());
    let outcome = run_chain(
        &ctx,
        &chain,
        &Collaborators {
            steps: &steps,
            sandbox: &sandbox,
            applier: &GitPatchApplier,
            sleeper: &ThreadSleeper,
        },
    )?;
    Ok(outcome.exit_code())
}
