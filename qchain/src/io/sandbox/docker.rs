//! [`JobBackend`] that drives the `docker` CLI.

use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::thread;

use tracing::{debug, instrument, warn};

use super::{JobBackend, JobStatus, SandboxError, SandboxJobSpec};
use crate::io::process::read_stream_tail;

/// `docker run` itself failed (daemon unreachable, image missing, bad flags).
const DOCKER_RUN_FAILURE: i32 = 125;
/// Reported when the client was terminated by a signal.
const SIGNALLED_EXIT_CODE: i32 = 137;
const CLIENT_STDERR_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DockerBackend {
    program: String,
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    fn output(&self, args: &[&str]) -> Result<std::process::Output, SandboxError> {
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| SandboxError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

/// A container started by `docker run`, attached to the client process.
#[derive(Debug)]
pub struct DockerJob {
    name: String,
    client: Child,
    stderr: Option<thread::JoinHandle<anyhow::Result<(Vec<u8>, usize)>>>,
    exit_code: Option<i32>,
}

impl DockerJob {
    fn client_stderr(&mut self) -> String {
        match self.stderr.take().map(thread::JoinHandle::join) {
            Some(Ok(Ok((bytes, _)))) => String::from_utf8_lossy(&bytes).trim().to_string(),
            _ => String::new(),
        }
    }
}

/// Arguments for `docker run`, in order. No shell is involved.
pub fn docker_run_args(spec: &SandboxJobSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "--name".into(), spec.name.clone()];
    if spec.stdin.is_some() {
        args.push("--interactive".into());
    }
    args.extend(["--workdir".into(), spec.workdir.clone()]);
    if let Some(user) = &spec.user {
        args.extend(["--user".into(), user.clone()]);
    }
    args.extend([
        "--memory".into(),
        spec.limits.memory.clone(),
        "--cpus".into(),
        spec.limits.cpus.to_string(),
        "--pids-limit".into(),
        spec.limits.pids_limit.to_string(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--cap-drop".into(),
        "ALL".into(),
    ]);
    if let Some(network) = &spec.network {
        args.extend(["--network".into(), network.clone()]);
    }
    for (key, value) in &spec.labels {
        args.extend(["--label".into(), format!("{key}={value}")]);
    }
    for mount in &spec.mounts {
        let mut fields = vec![
            "type=bind".to_string(),
            csv_field(&format!("source={}", mount.host_path.display())),
            csv_field(&format!("target={}", mount.sandbox_path)),
        ];
        if mount.read_only {
            fields.push("readonly".to_string());
        }
        args.extend(["--mount".into(), fields.join(",")]);
    }
    for (key, value) in &spec.env {
        args.extend(["--env".into(), format!("{key}={value}")]);
    }

    let entrypoint = spec.entrypoint.as_deref().unwrap_or_default();
    if let Some((program, rest)) = entrypoint.split_first() {
        args.extend(["--entrypoint".into(), program.clone()]);
        args.push(spec.image.clone());
        args.extend(rest.iter().cloned());
    } else {
        args.push(spec.image.clone());
    }
    args.extend(spec.argv.iter().cloned());
    args
}

/// Quote one field of a `--mount` value, which docker reads as a CSV record.
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

impl JobBackend for DockerBackend {
    type Handle = DockerJob;

    #[instrument(skip_all, fields(job = %spec.name))]
    fn start(&self, spec: &SandboxJobSpec) -> Result<DockerJob, SandboxError> {
        let mut cmd = self.command();
        cmd.args(docker_run_args(spec))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            // Container output is collected with `docker logs` once it exits.
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut client = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        debug!(pid = client.id(), "docker run spawned");

        let stderr = client
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || read_stream_tail(pipe, CLIENT_STDERR_LIMIT)));

        if let (Some(input), Some(mut pipe)) = (spec.stdin.clone(), client.stdin.take()) {
            // Closing the pipe after the write marks end of prompt.
            thread::spawn(move || {
                if let Err(err) = pipe.write_all(input.as_bytes()) {
                    warn!(err = %err, "sandbox closed stdin early");
                }
            });
        }

        Ok(DockerJob {
            name: spec.name.clone(),
            client,
            stderr,
            exit_code: None,
        })
    }

    fn poll(&self, handle: &mut DockerJob) -> Result<JobStatus, SandboxError> {
        if let Some(code) = handle.exit_code {
            return Ok(JobStatus::Exited(code));
        }
        let Some(status) = handle.client.try_wait()? else {
            return Ok(JobStatus::Running);
        };
        let code = status.code().unwrap_or(SIGNALLED_EXIT_CODE);
        if code == DOCKER_RUN_FAILURE {
            let stderr = handle.client_stderr();
            return Err(SandboxError::Daemon(format!("docker run failed: {stderr}")));
        }
        handle.exit_code = Some(code);
        Ok(JobStatus::Exited(code))
    }

    #[instrument(skip_all, fields(job = %handle.name))]
    fn kill(&self, handle: &mut DockerJob) -> Result<(), SandboxError> {
        let output = self.output(&["kill", &handle.name])?;
        if !output.status.success() {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker kill reported failure"
            );
        }
        // The attached client exits once the container is gone; make sure it does.
        if let Err(err) = handle.client.kill() {
            debug!(err = %err, "docker client already exited");
        }
        handle.client.wait()?;
        Ok(())
    }

    fn logs(&self, handle: &mut DockerJob, tail_lines: usize) -> Result<Vec<u8>, SandboxError> {
        let tail = tail_lines.to_string();
        let output = self.output(&["logs", "--tail", &tail, &handle.name])?;
        if !output.status.success() {
            return Err(SandboxError::Daemon(format!(
                "docker logs {}: {}",
                handle.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(combined)
    }

    #[instrument(skip_all, fields(job = %handle.name))]
    fn remove(&self, handle: &mut DockerJob) -> Result<(), SandboxError> {
        if handle.client.try_wait()?.is_none() {
            if let Err(err) = handle.client.kill() {
                debug!(err = %err, "docker client already exited");
            }
            handle.client.wait()?;
        }
        // Reap the stderr reader so no thread outlives the job.
        handle.client_stderr();

        let output = self.output(&["rm", "--force", &handle.name])?;
        if !output.status.success() {
            return Err(SandboxError::Daemon(format!(
                "docker rm {}: {}",
                handle.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("container removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::io::sandbox::{SandboxOutcome, SandboxRunner, VolumeMount};

    fn spec() -> SandboxJobSpec {
        let mut spec = SandboxJobSpec::new(
            "qchain-1-lint-r1",
            "local/codex-cli:latest",
            vec!["run".to_string(), "--stdin".to_string()],
            Duration::from_secs(180),
        )
        .expect("spec");
        spec.user = Some("node".to_string());
        spec.env = BTreeMap::from([("HTTP_PROXY".to_string(), "http://p:3128".to_string())]);
        spec.labels = BTreeMap::from([("app".to_string(), "codex-cli".to_string())]);
        spec.mounts = vec![
            VolumeMount {
                host_path: PathBuf::from("/runs/x/lint.r1.job"),
                sandbox_path: "/workspace/job".to_string(),
                read_only: false,
            },
            VolumeMount {
                host_path: PathBuf::from("/src/my repo"),
                sandbox_path: "/workspace/repo".to_string(),
                read_only: true,
            },
        ];
        spec.stdin = Some("prompt".to_string());
        spec
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn run_args_carry_limits_and_hardening() {
        let args = docker_run_args(&spec());
        assert_eq!(&args[..3], ["run", "--name", "qchain-1-lint-r1"]);
        assert!(args.contains(&"--interactive".to_string()));
        assert_eq!(value_after(&args, "--memory"), ["2g"]);
        assert_eq!(value_after(&args, "--cpus"), ["2"]);
        assert_eq!(value_after(&args, "--pids-limit"), ["512"]);
        assert_eq!(value_after(&args, "--security-opt"), ["no-new-privileges"]);
        assert_eq!(value_after(&args, "--cap-drop"), ["ALL"]);
        assert_eq!(value_after(&args, "--user"), ["node"]);
        assert!(value_after(&args, "--network").is_empty());
    }

    #[test]
    fn run_args_mount_exactly_the_declared_volumes() {
        let args = docker_run_args(&spec());
        assert_eq!(
            value_after(&args, "--mount"),
            [
                "type=bind,source=/runs/x/lint.r1.job,target=/workspace/job",
                "type=bind,source=/src/my repo,target=/workspace/repo,readonly",
            ]
        );
        assert_eq!(value_after(&args, "--env"), ["HTTP_PROXY=http://p:3128"]);
        assert_eq!(value_after(&args, "--label"), ["app=codex-cli"]);
    }

    #[test]
    fn image_and_argv_come_last() {
        let args = docker_run_args(&spec());
        assert_eq!(
            &args[args.len() - 3..],
            ["local/codex-cli:latest", "run", "--stdin"]
        );
    }

    #[test]
    fn entrypoint_override_splits_around_the_image() {
        let mut spec = spec();
        spec.entrypoint = Some(vec!["/bin/sh".to_string(), "-c".to_string()]);
        spec.argv = vec!["agent --stdin".to_string()];
        spec.stdin = None;
        let args = docker_run_args(&spec);
        assert!(!args.contains(&"--interactive".to_string()));
        assert_eq!(value_after(&args, "--entrypoint"), ["/bin/sh"]);
        assert_eq!(
            &args[args.len() - 3..],
            ["local/codex-cli:latest", "-c", "agent --stdin"]
        );
    }

    #[test]
    fn mount_fields_with_commas_are_quoted() {
        let mut spec = spec();
        spec.mounts[1].host_path = PathBuf::from("/src/a,b \"q\"");
        let args = docker_run_args(&spec);
        assert_eq!(
            value_after(&args, "--mount")[1],
            "type=bind,\"source=/src/a,b \"\"q\"\"\",target=/workspace/repo,readonly"
        );
    }

    #[test]
    fn missing_docker_binary_is_a_spawn_error() {
        let backend = DockerBackend::new("/nonexistent/docker-binary");
        let err = backend.start(&spec()).unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    /// A stand-in `docker` executable that appends each invocation to
    /// `calls.log` and runs `run_body` for `docker run`.
    #[cfg(unix)]
    struct FakeDocker {
        _temp: tempfile::TempDir,
        dir: PathBuf,
        program: PathBuf,
    }

    #[cfg(unix)]
    impl FakeDocker {
        fn new(run_body: &str) -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let dir = temp.path().to_path_buf();
            let script = format!(
                "#!/bin/sh\n\
                 dir=$(dirname \"$0\")\n\
                 echo \"$*\" >> \"$dir/calls.log\"\n\
                 case \"$1\" in\n\
                 run) {run_body} ;;\n\
                 logs) echo agent-stdout; echo agent-stderr >&2 ;;\n\
                 esac\n"
            );
            let staging = dir.join("docker.sh");
            std::fs::write(&staging, script).expect("write script");
            // Installed by another process: this one never holds a writable
            // descriptor to the executable (ETXTBSY under parallel tests).
            let program = dir.join("docker");
            let status = Command::new("install")
                .args(["-m", "755"])
                .arg(&staging)
                .arg(&program)
                .status()
                .expect("install fake docker");
            assert!(status.success());
            Self {
                _temp: temp,
                dir,
                program,
            }
        }

        fn runner(&self) -> SandboxRunner<DockerBackend> {
            SandboxRunner::new(DockerBackend::new(self.program.to_string_lossy()))
                .with_poll_interval(Duration::from_millis(20))
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[cfg(unix)]
    fn fake_job(timeout: Duration) -> SandboxJobSpec {
        let mut spec = SandboxJobSpec::new(
            "qchain-fake-job",
            "agent:latest",
            vec!["agent".to_string()],
            timeout,
        )
        .expect("spec");
        spec.stdin = Some("fix it please".to_string());
        spec
    }

    #[cfg(unix)]
    #[test]
    fn completed_job_collects_both_log_streams_then_removes_the_container() {
        let docker = FakeDocker::new("cat > \"$dir/stdin.txt\"; exit 0");

        let outcome = docker.runner().run(&fake_job(Duration::from_secs(20)));

        let result = match outcome {
            SandboxOutcome::Completed(result) => result,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.logs, "agent-stdout\nagent-stderr\n");
        assert_eq!(
            std::fs::read_to_string(docker.dir.join("stdin.txt")).expect("stdin"),
            "fix it please"
        );
        let calls = docker.calls();
        assert!(calls[0].starts_with("run --name qchain-fake-job --interactive "));
        assert!(calls.contains(&"logs --tail 10000 qchain-fake-job".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("kill")));
        assert_eq!(calls.last().map(String::as_str), Some("rm --force qchain-fake-job"));
    }

    #[cfg(unix)]
    #[test]
    fn hung_job_is_killed_reaped_and_removed() {
        let docker = FakeDocker::new("exec sleep 30");
        let runner = docker.runner();

        let started = Instant::now();
        let outcome = runner.run(&fake_job(Duration::from_secs(1)));
        let elapsed = started.elapsed();

        assert!(matches!(outcome, SandboxOutcome::TimedOut { .. }));
        assert!(elapsed < Duration::from_secs(5), "returned after {elapsed:?}");
        let calls = docker.calls();
        assert_eq!(
            calls[1..],
            ["kill qchain-fake-job", "rm --force qchain-fake-job"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn failed_docker_run_is_a_daemon_error_and_still_removes() {
        let docker = FakeDocker::new("echo 'Cannot connect to the Docker daemon' >&2; exit 125");

        let outcome = docker.runner().run(&fake_job(Duration::from_secs(20)));

        match outcome {
            SandboxOutcome::InfraError(SandboxError::Daemon(message)) => {
                assert!(message.contains("Cannot connect to the Docker daemon"), "{message}");
            }
            other => panic!("expected daemon error, got {other:?}"),
        }
        let calls = docker.calls();
        assert_eq!(calls.len(), 2, "{calls:?}");
        assert_eq!(calls[1], "rm --force qchain-fake-job");
    }
}
