//! Parameters of one invocation, fixed at startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::core::retry::RetryPolicy;
use crate::core::types::StepSpec;
use crate::io::artifacts::RunDir;
use crate::io::config::RunnerConfig;

/// Read-only run parameters shared by every stage of the pipeline.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub repo_root: PathBuf,
    pub run_dir: RunDir,
    pub dry_run: bool,
    pub retry: RetryPolicy,
    /// Patches that may be applied to a single step before the run aborts.
    pub max_repairs: u32,
    pub config: RunnerConfig,
    /// Sandbox environment resolved from the allow-list at startup.
    pub sandbox_env: BTreeMap<String, String>,
}

/// Command-line knobs that feed [`RunContext::new`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOptions {
    pub dry_run: bool,
    pub max_attempts: u32,
    pub base_backoff_secs: f64,
    pub max_repairs: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            dry_run: false,
            max_attempts: retry.max_attempts,
            base_backoff_secs: retry.base_backoff_secs,
            max_repairs: 3,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("--max-attempts must be >= 1"));
        }
        if !(self.base_backoff_secs.is_finite() && self.base_backoff_secs >= 0.0) {
            return Err(anyhow!("--backoff must be a finite number >= 0"));
        }
        Ok(())
    }
}

impl RunContext {
    /// Validate options and resolve the repository root.
    ///
    /// The sandbox environment is read from the host exactly once, here.
    pub fn new(
        repo: &Path,
        run_dir: RunDir,
        options: RunOptions,
        config: RunnerConfig,
    ) -> Result<Self> {
        Self::with_env_lookup(repo, run_dir, options, config, |key| std::env::var(key).ok())
    }

    pub fn with_env_lookup<F>(
        repo: &Path,
        run_dir: RunDir,
        options: RunOptions,
        config: RunnerConfig,
        lookup: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        options.validate()?;
        let repo_root = repo
            .canonicalize()
            .with_context(|| format!("resolve repo {}", repo.display()))?;
        if !repo_root.is_dir() {
            return Err(anyhow!("repo {} is not a directory", repo_root.display()));
        }
        let sandbox_env = config.sandbox.resolve_env(lookup);
        Ok(Self {
            repo_root,
            run_dir,
            dry_run: options.dry_run,
            retry: RetryPolicy {
                max_attempts: options.max_attempts,
                base_backoff_secs: options.base_backoff_secs,
            },
            max_repairs: options.max_repairs,
            config,
            sandbox_env,
        })
    }

    pub fn run_id(&self) -> &str {
        self.run_dir.run_id()
    }

    /// Wall-clock limit for one execution of `step`.
    pub fn step_timeout(&self, step: &StepSpec) -> Duration {
        Duration::from_secs(step.timeout_secs.unwrap_or(self.config.step_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn run_dir(root: &Path) -> RunDir {
        RunDir::create(&root.join("runs"), Utc::now()).expect("run dir")
    }

    #[test]
    fn rejects_zero_attempts_and_bad_backoff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let zero = RunOptions {
            max_attempts: 0,
            ..RunOptions::default()
        };
        assert!(
            RunContext::new(temp.path(), run_dir(temp.path()), zero, RunnerConfig::default())
                .is_err()
        );

        let nan = RunOptions {
            base_backoff_secs: f64::NAN,
            ..RunOptions::default()
        };
        assert!(
            RunContext::new(temp.path(), run_dir(temp.path()), nan, RunnerConfig::default())
                .is_err()
        );
    }

    #[test]
    fn step_timeout_prefers_the_step_override() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = RunContext::with_env_lookup(
            temp.path(),
            run_dir(temp.path()),
            RunOptions::default(),
            RunnerConfig::default(),
            |_| None,
        )
        .expect("context");

        let mut step = StepSpec::new("lint", "true");
        assert_eq!(ctx.step_timeout(&step), Duration::from_secs(3600));
        step.timeout_secs = Some(5);
        assert_eq!(ctx.step_timeout(&step), Duration::from_secs(5));
        assert!(ctx.repo_root.is_absolute());
        assert!(ctx.sandbox_env.is_empty());
    }
}
