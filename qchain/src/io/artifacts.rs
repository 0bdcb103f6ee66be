//! Per-run artifact directory `<runs>/<YYYYMMDD-HHMMSS>/`.
//!
//! The directory is append-only: every file is created with create-new
//! semantics and never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{AttemptResult, RunSummary};

const RUN_ID_FORMAT: &str = "%Y%m%d-%H%M%S";
const MAX_SUFFIX: u32 = 1000;

/// Paths of the files persisted for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub log_path: PathBuf,
    pub meta_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunDir {
    run_id: String,
    path: PathBuf,
}

impl RunDir {
    /// Create a fresh run directory under `runs_root` named after `started_at`.
    ///
    /// If that name is taken, `-1`, `-2`, ... are appended until one is free.
    pub fn create(runs_root: &Path, started_at: DateTime<Utc>) -> Result<Self> {
        fs::create_dir_all(runs_root)
            .with_context(|| format!("create runs dir {}", runs_root.display()))?;
        let stamp = started_at.format(RUN_ID_FORMAT).to_string();

        for suffix in 0..=MAX_SUFFIX {
            let run_id = if suffix == 0 {
                stamp.clone()
            } else {
                format!("{stamp}-{suffix}")
            };
            let path = runs_root.join(&run_id);
            match fs::create_dir(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "run dir created");
                    return Ok(Self { run_id, path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create run dir {}", path.display()));
                }
            }
        }
        Err(anyhow!(
            "no free run dir name for {stamp} under {}",
            runs_root.display()
        ))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn step_file(&self, step_id: &str, round: u32, suffix: &str) -> PathBuf {
        self.path.join(format!("{step_id}.r{round}.{suffix}"))
    }

    /// Persist an attempt: combined output as `.log`, metadata as `.json`.
    pub fn write_attempt(&self, result: &AttemptResult) -> Result<AttemptPaths> {
        let base = format!("attempt{}", result.attempt);
        let paths = AttemptPaths {
            log_path: self.step_file(&result.step_id, result.round, &format!("{base}.log")),
            meta_path: self.step_file(&result.step_id, result.round, &format!("{base}.json")),
        };
        write_new(&paths.log_path, result.output.as_bytes())?;
        write_json_new(&paths.meta_path, result)?;
        Ok(paths)
    }

    pub fn write_summary(&self, step_id: &str, round: u32, text: &str) -> Result<PathBuf> {
        let path = self.step_file(step_id, round, "summary.txt");
        write_new(&path, text.as_bytes())?;
        Ok(path)
    }

    pub fn write_agent_output(&self, step_id: &str, round: u32, logs: &str) -> Result<PathBuf> {
        let path = self.step_file(step_id, round, "agent.out");
        write_new(&path, logs.as_bytes())?;
        Ok(path)
    }

    pub fn write_applied_diff(&self, step_id: &str, round: u32, diff: &str) -> Result<PathBuf> {
        let path = self.step_file(step_id, round, "applied.diff");
        write_new(&path, diff.as_bytes())?;
        Ok(path)
    }

    /// Create the read-write directory mounted into the sandbox job.
    pub fn create_job_dir(&self, step_id: &str, round: u32) -> Result<PathBuf> {
        let path = self.step_file(step_id, round, "job");
        fs::create_dir(&path).with_context(|| format!("create job dir {}", path.display()))?;
        Ok(path)
    }

    pub fn write_run_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.path.join("run.json");
        write_json_new(&path, summary)?;
        Ok(path)
    }
}

fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write {}", path.display()))
}

fn write_json_new<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_new(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
    }

    fn attempt(attempt: u32) -> AttemptResult {
        AttemptResult {
            step_id: "lint".to_string(),
            round: 1,
            attempt,
            exit_code: 2,
            output: "E501 line too long\n".to_string(),
            started_at: started(),
            duration_ms: 12,
            timed_out: false,
        }
    }

    #[test]
    fn run_dir_is_named_by_timestamp_and_suffixed_on_collision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs = temp.path().join("runs");

        let first = RunDir::create(&runs, started()).expect("first");
        let second = RunDir::create(&runs, started()).expect("second");
        let third = RunDir::create(&runs, started()).expect("third");

        assert_eq!(first.run_id(), "20260304-050607");
        assert_eq!(second.run_id(), "20260304-050607-1");
        assert_eq!(third.run_id(), "20260304-050607-2");
        assert!(second.path().is_dir());
    }

    #[test]
    fn attempt_files_follow_the_naming_scheme() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RunDir::create(temp.path(), started()).expect("run dir");

        let paths = run.write_attempt(&attempt(2)).expect("write");
        assert_eq!(
            paths.log_path.file_name().and_then(|n| n.to_str()),
            Some("lint.r1.attempt2.log")
        );
        assert_eq!(
            fs::read_to_string(&paths.log_path).expect("read"),
            "E501 line too long\n"
        );

        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("read"))
                .expect("json");
        assert_eq!(meta["exit_code"], 2);
        assert_eq!(meta["attempt"], 2);
        assert!(meta.get("output").is_none());
    }

    #[test]
    fn artifacts_are_never_overwritten() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RunDir::create(temp.path(), started()).expect("run dir");

        run.write_summary("lint", 1, "first").expect("write");
        assert!(run.write_summary("lint", 1, "second").is_err());
        assert_eq!(
            fs::read_to_string(run.path().join("lint.r1.summary.txt")).expect("read"),
            "first"
        );
        // A new round gets its own files.
        run.write_summary("lint", 2, "second").expect("round 2");
    }

    #[test]
    fn job_dir_is_per_round() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RunDir::create(temp.path(), started()).expect("run dir");
        let job = run.create_job_dir("tests", 1).expect("job dir");
        assert!(job.ends_with("tests.r1.job"));
        assert!(job.is_dir());
        assert!(run.create_job_dir("tests", 1).is_err());
    }
}
