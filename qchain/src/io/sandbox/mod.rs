//! Isolated, resource-capped execution of one command (the repair agent).
//!
//! [`SandboxRunner`] owns the policy: start, poll on a fixed interval, kill at
//! the deadline, collect a bounded log tail, and always release the job. The
//! mechanics live behind [`JobBackend`] so the policy can be exercised against
//! a scripted backend; [`docker::DockerBackend`] is the production one.

pub mod docker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::summary::{format_duration, tail_lines};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_LOG_TAIL_LINES: usize = 10_000;

/// Exit code reported when the sandbox produced no exit code of its own.
pub const SANDBOX_FAILURE_EXIT_CODE: i32 = 1;

static JOB_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]+$").expect("valid job name regex"));

/// Infrastructure-level sandbox failures. Never a verdict on the agent's work.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The daemon or CLI reported a failure.
    #[error("sandbox daemon: {0}")]
    Daemon(String),

    #[error("invalid sandbox job: {0}")]
    InvalidSpec(String),

    #[error("sandbox i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Memory cap in docker syntax (`512m`, `2g`).
    pub memory: String,
    pub cpus: f64,
    pub pids_limit: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpus: 2.0,
            pids_limit: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub sandbox_path: String,
    pub read_only: bool,
}

/// One sandbox invocation. Plain value; build with [`SandboxJobSpec::new`].
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxJobSpec {
    pub name: String,
    pub image: String,
    pub argv: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub workdir: String,
    pub user: Option<String>,
    /// The complete sandbox environment. Nothing from the host is added.
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub mounts: Vec<VolumeMount>,
    pub network: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Written to the job's stdin, then stdin is closed.
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl SandboxJobSpec {
    /// Spec with required fields set and defaults elsewhere.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        argv: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, SandboxError> {
        let spec = Self {
            name: name.into(),
            image: image.into(),
            argv,
            entrypoint: None,
            workdir: "/workspace".to_string(),
            user: None,
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
            mounts: Vec::new(),
            network: None,
            labels: BTreeMap::new(),
            stdin: None,
            timeout,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        let invalid = |msg: String| Err(SandboxError::InvalidSpec(msg));
        if !JOB_NAME_RE.is_match(&self.name) {
            return invalid(format!("job name '{}' must match {}", self.name, JOB_NAME_RE.as_str()));
        }
        if self.image.trim().is_empty() {
            return invalid("image must not be empty".to_string());
        }
        let has_entrypoint = self
            .entrypoint
            .as_ref()
            .is_some_and(|e| e.first().is_some_and(|p| !p.is_empty()));
        if self.argv.is_empty() && !has_entrypoint {
            return invalid("argv must not be empty without an entrypoint".to_string());
        }
        if self.timeout.is_zero() {
            return invalid("timeout must be > 0".to_string());
        }
        if !self.workdir.starts_with('/') {
            return invalid(format!("workdir '{}' must be absolute", self.workdir));
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return invalid(format!("invalid environment variable name '{key}'"));
            }
        }
        for mount in &self.mounts {
            let host = mount.host_path.to_string_lossy();
            if !mount.host_path.is_absolute() || !mount.sandbox_path.starts_with('/') {
                return invalid(format!(
                    "mount {} -> {} must use absolute paths",
                    host, mount.sandbox_path
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxJobResult {
    pub exit_code: i32,
    /// Combined stdout/stderr, at most the runner's tail length in lines.
    pub logs: String,
    pub duration: Duration,
}

/// Every way a sandbox invocation can end.
#[derive(Debug)]
pub enum SandboxOutcome {
    Completed(SandboxJobResult),
    /// Killed at the deadline.
    TimedOut { timeout: Duration },
    InfraError(SandboxError),
}

impl SandboxOutcome {
    /// Flatten to `(exit_code, logs)`, with synthetic messages for failures.
    pub fn into_exit_code_and_logs(self) -> (i32, String) {
        match self {
            SandboxOutcome::Completed(result) => (result.exit_code, result.logs),
            SandboxOutcome::TimedOut { timeout } => (
                SANDBOX_FAILURE_EXIT_CODE,
                format!("sandbox job timed out after {}", format_duration(timeout)),
            ),
            SandboxOutcome::InfraError(err) => {
                (SANDBOX_FAILURE_EXIT_CODE, format!("sandbox error: {err}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Exited(i32),
}

/// Capability interface over an isolated-execution backend.
pub trait JobBackend {
    type Handle;

    fn start(&self, spec: &SandboxJobSpec) -> Result<Self::Handle, SandboxError>;
    fn poll(&self, handle: &mut Self::Handle) -> Result<JobStatus, SandboxError>;
    fn kill(&self, handle: &mut Self::Handle) -> Result<(), SandboxError>;
    /// Combined output, last `tail_lines` lines.
    fn logs(&self, handle: &mut Self::Handle, tail_lines: usize) -> Result<Vec<u8>, SandboxError>;
    /// Reclaim every resource held by the job. Called exactly once per started job.
    fn remove(&self, handle: &mut Self::Handle) -> Result<(), SandboxError>;
}

/// Releases a started job when dropped, on every exit path.
struct JobGuard<'a, B: JobBackend> {
    backend: &'a B,
    handle: B::Handle,
}

impl<B: JobBackend> Drop for JobGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.remove(&mut self.handle) {
            warn!(err = %err, "failed to release sandbox job");
        }
    }
}

/// Drives one job at a time through a [`JobBackend`].
#[derive(Debug)]
pub struct SandboxRunner<B> {
    backend: B,
    poll_interval: Duration,
    log_tail_lines: usize,
}

impl<B: JobBackend> SandboxRunner<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_log_tail_lines(mut self, log_tail_lines: usize) -> Self {
        self.log_tail_lines = log_tail_lines;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run `spec` to completion or to its deadline.
    ///
    /// Returns within `timeout + poll_interval` (plus the backend's kill time).
    #[instrument(skip_all, fields(job = %spec.name, timeout_secs = spec.timeout.as_secs()))]
    pub fn run(&self, spec: &SandboxJobSpec) -> SandboxOutcome {
        if let Err(err) = spec.validate() {
            return SandboxOutcome::InfraError(err);
        }
        let started = Instant::now();
        info!(image = %spec.image, "starting sandbox job");
        let handle = match self.backend.start(spec) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(err = %err, "sandbox job failed to start");
                return SandboxOutcome::InfraError(err);
            }
        };
        let mut job = JobGuard {
            backend: &self.backend,
            handle,
        };

        loop {
            if started.elapsed() >= spec.timeout {
                warn!("sandbox job timed out, killing");
                if let Err(err) = self.backend.kill(&mut job.handle) {
                    warn!(err = %err, "failed to kill sandbox job");
                }
                return SandboxOutcome::TimedOut {
                    timeout: spec.timeout,
                };
            }

            match self.backend.poll(&mut job.handle) {
                Ok(JobStatus::Running) => {}
                Ok(JobStatus::Exited(exit_code)) => {
                    let raw = match self.backend.logs(&mut job.handle, self.log_tail_lines) {
                        Ok(raw) => raw,
                        Err(err) => return SandboxOutcome::InfraError(err),
                    };
                    let text = String::from_utf8_lossy(&raw);
                    let logs = tail_lines(&text, self.log_tail_lines).to_string();
                    let duration = started.elapsed();
                    debug!(
                        exit_code,
                        duration_ms = duration.as_millis() as u64,
                        "sandbox job exited"
                    );
                    return SandboxOutcome::Completed(SandboxJobResult {
                        exit_code,
                        logs,
                        duration,
                    });
                }
                Err(err) => {
                    warn!(err = %err, "sandbox poll failed");
                    return SandboxOutcome::InfraError(err);
                }
            }

            let remaining = spec.timeout.saturating_sub(started.elapsed());
            thread::sleep(self.poll_interval.min(remaining));
        }
    }
}
