//! Test-only fakes and fixtures: scripted collaborators and a git repo.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::context::{RunContext, RunOptions};
use crate::io::artifacts::RunDir;
use crate::io::config::RunnerConfig;
use crate::io::git::{ApplyOutcome, PatchApplier};
use crate::io::sandbox::{JobBackend, JobStatus, SandboxError, SandboxJobSpec};
use crate::io::step_runner::{StepExecution, StepRequest, StepRunner};
use crate::pipeline::Sleeper;

/// Step runner that replays scripted exit codes per step id.
#[derive(Debug, Default)]
pub struct ScriptedStepRunner {
    scripts: RefCell<BTreeMap<String, VecDeque<i32>>>,
    calls: RefCell<Vec<(String, u32, u32)>>,
}

impl ScriptedStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue exit codes for successive executions of `step_id`.
    pub fn script(self, step_id: &str, exit_codes: impl IntoIterator<Item = i32>) -> Self {
        self.scripts
            .borrow_mut()
            .entry(step_id.to_string())
            .or_default()
            .extend(exit_codes);
        self
    }

    /// `(step_id, round, attempt)` for every execution, in order.
    pub fn calls(&self) -> Vec<(String, u32, u32)> {
        self.calls.borrow().clone()
    }

    pub fn executions_of(&self, step_id: &str) -> usize {
        self.calls.borrow().iter().filter(|c| c.0 == step_id).count()
    }
}

impl StepRunner for ScriptedStepRunner {
    fn run(&self, request: &StepRequest) -> Result<StepExecution> {
        self.calls.borrow_mut().push((
            request.step_id.clone(),
            request.round,
            request.attempt,
        ));
        let exit_code = self
            .scripts
            .borrow_mut()
            .get_mut(&request.step_id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted result left for step '{}'", request.step_id))?;
        Ok(StepExecution {
            exit_code,
            output: format!(
                "{} round {} attempt {} exit {exit_code}\n",
                request.step_id, request.round, request.attempt
            ),
            timed_out: false,
        })
    }
}

/// Behavior of one scripted sandbox job.
#[derive(Debug, Clone)]
pub struct ScriptedJob {
    exit_code: i32,
    logs: String,
    /// `None` never exits on its own.
    runs_for: Option<Duration>,
    start_error: Option<String>,
}

impl ScriptedJob {
    pub fn exits(exit_code: i32, logs: &str) -> Self {
        Self {
            exit_code,
            logs: logs.to_string(),
            runs_for: Some(Duration::ZERO),
            start_error: None,
        }
    }

    pub fn hangs() -> Self {
        Self {
            exit_code: 0,
            logs: String::new(),
            runs_for: None,
            start_error: None,
        }
    }

    pub fn fails_to_start(message: &str) -> Self {
        Self {
            start_error: Some(message.to_string()),
            ..Self::hangs()
        }
    }
}

#[derive(Debug)]
pub struct ScriptedHandle {
    name: String,
    job: ScriptedJob,
    started: Instant,
    killed: bool,
}

/// Sandbox backend that replays scripted jobs and records every call.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    jobs: RefCell<VecDeque<ScriptedJob>>,
    started: RefCell<Vec<SandboxJobSpec>>,
    killed: RefCell<Vec<String>>,
    removed: RefCell<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(jobs: Vec<ScriptedJob>) -> Self {
        Self {
            jobs: RefCell::new(jobs.into()),
            ..Self::default()
        }
    }

    pub fn started(&self) -> Vec<SandboxJobSpec> {
        self.started.borrow().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.borrow().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.borrow().clone()
    }
}

impl JobBackend for ScriptedBackend {
    type Handle = ScriptedHandle;

    fn start(&self, spec: &SandboxJobSpec) -> Result<ScriptedHandle, SandboxError> {
        let job = self
            .jobs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| SandboxError::Daemon("no scripted job left".to_string()))?;
        if let Some(message) = &job.start_error {
            return Err(SandboxError::Daemon(message.clone()));
        }
        self.started.borrow_mut().push(spec.clone());
        Ok(ScriptedHandle {
            name: spec.name.clone(),
            job,
            started: Instant::now(),
            killed: false,
        })
    }

    fn poll(&self, handle: &mut ScriptedHandle) -> Result<JobStatus, SandboxError> {
        if handle.killed {
            return Ok(JobStatus::Exited(137));
        }
        match handle.job.runs_for {
            Some(runs_for) if handle.started.elapsed() >= runs_for => {
                Ok(JobStatus::Exited(handle.job.exit_code))
            }
            _ => Ok(JobStatus::Running),
        }
    }

    fn kill(&self, handle: &mut ScriptedHandle) -> Result<(), SandboxError> {
        handle.killed = true;
        self.killed.borrow_mut().push(handle.name.clone());
        Ok(())
    }

    fn logs(
        &self,
        handle: &mut ScriptedHandle,
        _tail_lines: usize,
    ) -> Result<Vec<u8>, SandboxError> {
        Ok(handle.job.logs.clone().into_bytes())
    }

    fn remove(&self, handle: &mut ScriptedHandle) -> Result<(), SandboxError> {
        self.removed.borrow_mut().push(handle.name.clone());
        Ok(())
    }
}

/// Records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays.borrow_mut().push(delay);
    }
}

/// Applier that returns scripted exit codes and records the diffs it was given.
#[derive(Debug, Default)]
pub struct ScriptedApplier {
    exit_codes: RefCell<VecDeque<i32>>,
    diffs: RefCell<Vec<String>>,
}

impl ScriptedApplier {
    pub fn new(exit_codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            exit_codes: RefCell::new(exit_codes.into_iter().collect()),
            diffs: RefCell::new(Vec::new()),
        }
    }

    pub fn diffs(&self) -> Vec<String> {
        self.diffs.borrow().clone()
    }
}

impl PatchApplier for ScriptedApplier {
    fn apply(&self, _repo: &Path, diff: &str) -> Result<ApplyOutcome> {
        self.diffs.borrow_mut().push(diff.to_string());
        let exit_code = self
            .exit_codes
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted apply result left"))?;
        let stderr = if exit_code == 0 {
            String::new()
        } else {
            "error: patch failed".to_string()
        };
        Ok(ApplyOutcome { exit_code, stderr })
    }
}

/// Context with `<root>/repo` as the repository and `<root>/runs` for artifacts.
pub fn test_context(root: &Path, dry_run: bool) -> RunContext {
    let repo = root.join("repo");
    fs::create_dir_all(&repo).expect("create repo dir");
    let options = RunOptions {
        dry_run,
        ..RunOptions::default()
    };
    context_for(&repo, &root.join("runs"), options)
}

/// Context for an existing repository, isolated from the host environment.
pub fn context_for(repo: &Path, runs: &Path, options: RunOptions) -> RunContext {
    let run_dir = RunDir::create(runs, Utc::now()).expect("create run dir");
    RunContext::with_env_lookup(repo, run_dir, options, RunnerConfig::default(), |_| None)
        .expect("run context")
}

/// A throwaway git repository with one initial commit.
#[derive(Debug)]
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        Self::with_dir_name("repo")
    }

    /// Repository at `<tempdir>/<name>`, for names with spaces or quotes.
    pub fn with_dir_name(name: &str) -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join(name);
        fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

        run_git(&root, &["init", "--quiet"])?;
        run_git(&root, &["config", "user.email", "test@example.com"])?;
        run_git(&root, &["config", "user.name", "test"])?;
        run_git(&root, &["config", "commit.gpgsign", "false"])?;
        fs::write(root.join("README.md"), "hi\n").context("write README.md")?;
        run_git(&root, &["add", "README.md"])?;
        run_git(&root, &["commit", "--quiet", "-m", "init"])?;

        Ok(Self { _temp: temp, root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory next to the repository, outside its worktree.
    pub fn sibling(&self, name: &str) -> PathBuf {
        self.root
            .parent()
            .map_or_else(|| self.root.join(name), |parent| parent.join(name))
    }

    /// `git status --porcelain` lines, untracked files included.
    pub fn status(&self) -> Result<Vec<String>> {
        let out = git_output(&self.root, &["status", "--porcelain=v1", "-uall"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Write and commit `rel`.
    pub fn commit_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        run_git(&self.root, &["add", "--", rel])?;
        run_git(&self.root, &["commit", "--quiet", "-m", &format!("add {rel}")])
    }
}

fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    git_output(root, args).map(drop)
}

fn git_output(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
