//! Local execution of step commands.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::summary::format_duration;
use crate::io::process::{Echo, run_command};

/// Exit code reported for a step killed at its deadline (same as `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone)]
pub struct StepRequest {
    pub step_id: String,
    pub command: String,
    pub workdir: PathBuf,
    pub round: u32,
    pub attempt: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepExecution {
    pub exit_code: i32,
    /// Combined stdout/stderr in arrival order.
    pub output: String,
    pub timed_out: bool,
}

/// Abstraction over step execution so the driver can be tested without shells.
pub trait StepRunner {
    fn run(&self, request: &StepRequest) -> Result<StepExecution>;
}

/// Runs `bash -lc <command>` in the repository root, echoing output live.
#[derive(Debug, Clone)]
pub struct ShellStepRunner {
    pub output_limit_bytes: usize,
    pub echo: Echo,
}

impl ShellStepRunner {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self {
            output_limit_bytes,
            echo: Echo::Stdout,
        }
    }
}

impl StepRunner for ShellStepRunner {
    #[instrument(skip_all, fields(step = %request.step_id, round = request.round, attempt = request.attempt))]
    fn run(&self, request: &StepRequest) -> Result<StepExecution> {
        let mut cmd = Command::new("bash");
        // Merge stderr into stdout inside the shell so ordering is preserved.
        cmd.arg("-lc")
            .arg(format!("exec 2>&1\n{}", request.command))
            .current_dir(&request.workdir);

        let output = run_command(
            cmd,
            Some(request.timeout),
            self.output_limit_bytes,
            self.echo,
        )
        .with_context(|| format!("run step '{}'", request.step_id))?;

        let exit_code = if output.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            output.status.code().unwrap_or(-1)
        };
        let mut text = output.stdout_text();
        if output.timed_out {
            text.push_str(&format!(
                "\n[step timed out after {}]\n",
                format_duration(request.timeout)
            ));
        }
        debug!(exit_code, timed_out = output.timed_out, "step finished");
        Ok(StepExecution {
            exit_code,
            output: text,
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(workdir: PathBuf, command: &str, timeout: Duration) -> StepRequest {
        StepRequest {
            step_id: "check".to_string(),
            command: command.to_string(),
            workdir,
            round: 1,
            attempt: 1,
            timeout,
        }
    }

    fn quiet() -> ShellStepRunner {
        ShellStepRunner {
            output_limit_bytes: 10_000,
            echo: Echo::Quiet,
        }
    }

    #[test]
    fn merges_stderr_and_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = quiet()
            .run(&request(
                temp.path().to_path_buf(),
                "echo out; echo err >&2; exit 4",
                Duration::from_secs(10),
            ))
            .expect("run");
        assert_eq!(exec.exit_code, 4);
        assert!(exec.output.ends_with("out\nerr\n"), "{}", exec.output);
        assert!(!exec.timed_out);
    }

    #[test]
    fn runs_in_the_repository_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let exec = quiet()
            .run(&request(
                temp.path().to_path_buf(),
                "test -f marker.txt",
                Duration::from_secs(10),
            ))
            .expect("run");
        assert_eq!(exec.exit_code, 0);
    }

    #[test]
    fn timeout_maps_to_124() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = quiet()
            .run(&request(
                temp.path().to_path_buf(),
                "sleep 10",
                Duration::from_millis(300),
            ))
            .expect("run");
        assert!(exec.timed_out);
        assert_eq!(exec.exit_code, TIMEOUT_EXIT_CODE);
        assert!(exec.output.contains("[step timed out after 300ms]"));
    }
}
