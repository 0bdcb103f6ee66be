//! Helpers for running child processes with timeouts and bounded output.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long readers may keep draining after a timeout kill. A descendant that
/// outlived the kill can hold the pipes open for as long as it runs.
const READER_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK_BYTES: usize = 8192;

/// Captured child process output.
///
/// Both streams keep their *last* `output_limit_bytes`; `*_dropped` counts the
/// leading bytes that were discarded.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_dropped: usize,
    pub stderr_dropped: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout as text, prefixed with a notice when the head was dropped.
    pub fn stdout_text(&self) -> String {
        let mut text = String::new();
        if self.stdout_dropped > 0 {
            text.push_str(&format!(
                "[output truncated: first {} bytes dropped]\n",
                self.stdout_dropped
            ));
        }
        text.push_str(&String::from_utf8_lossy(&self.stdout));
        text
    }
}

/// Where stdout goes while the child runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    /// Only capture.
    Quiet,
    /// Also copy output to this process's stdout as it arrives.
    Stdout,
}

/// Run a command with stdin closed, capturing stdout/stderr without risking
/// pipe deadlocks.
///
/// Output is read concurrently while the child runs. When `timeout` elapses the
/// child and its direct children are killed and `timed_out` is set.
///
/// The child stays in this process's group, so a terminal interrupt reaches it
/// together with the runner.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    echo: Echo,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_capture = Capture::spawn(stdout, output_limit_bytes, echo);
    let stderr_capture = Capture::spawn(stderr, output_limit_bytes, Echo::Quiet);

    let mut timed_out = false;
    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                kill_children(child.id());
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
        None => child.wait().context("wait for command")?,
    };

    let grace = timed_out.then_some(READER_GRACE);
    let (stdout, stdout_dropped) = stdout_capture.finish(grace).context("collect stdout")?;
    let (stderr, stderr_dropped) = stderr_capture.finish(grace).context("collect stderr")?;

    if stdout_dropped > 0 || stderr_dropped > 0 {
        warn!(stdout_dropped, stderr_dropped, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_dropped,
        stderr_dropped,
        timed_out,
    })
}

/// SIGKILL the direct children of `pid` (the shell's foreground command).
#[cfg(unix)]
fn kill_children(pid: u32) {
    let result = Command::new("pkill")
        .args(["-KILL", "-P", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        warn!(err = %e, pid, "failed to kill child processes");
    }
}

#[cfg(not(unix))]
fn kill_children(_pid: u32) {}

/// The last `limit` bytes of a stream.
#[derive(Debug, Default)]
pub(crate) struct TailBuffer {
    bytes: VecDeque<u8>,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// Append `data`, evicting from the front so at most `limit` bytes remain.
    pub(crate) fn push(&mut self, data: &[u8]) {
        let skip = data.len().saturating_sub(self.limit);
        let data = &data[skip..];
        let evict = (self.bytes.len() + data.len()).saturating_sub(self.limit);
        self.bytes.drain(..evict);
        self.bytes.extend(data);
        self.dropped += skip + evict;
    }

    /// `(kept bytes, dropped byte count)`.
    pub(crate) fn into_parts(self) -> (Vec<u8>, usize) {
        (Vec::from(self.bytes), self.dropped)
    }
}

/// A stream drained on its own thread into a shared [`TailBuffer`].
struct Capture {
    tail: Arc<Mutex<TailBuffer>>,
    reader: thread::JoinHandle<Result<()>>,
}

impl Capture {
    fn spawn<R: Read + Send + 'static>(stream: R, limit: usize, echo: Echo) -> Self {
        let tail = Arc::new(Mutex::new(TailBuffer::new(limit)));
        let sink = Arc::clone(&tail);
        let reader = thread::spawn(move || drain_into(stream, &sink, echo));
        Self { tail, reader }
    }

    /// Wait for EOF and take what was captured.
    ///
    /// With a `grace` the wait is bounded: once it expires the bytes read so
    /// far are returned and the reader is left to run out on its own.
    fn finish(self, grace: Option<Duration>) -> Result<(Vec<u8>, usize)> {
        if let Some(grace) = grace {
            let deadline = Instant::now() + grace;
            while !self.reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if !self.reader.is_finished() {
                warn!("output pipe still open after kill, keeping partial output");
                return take_tail(&self.tail);
            }
        }
        match self.reader.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("output reader thread panicked")),
        }
        take_tail(&self.tail)
    }
}

fn take_tail(tail: &Mutex<TailBuffer>) -> Result<(Vec<u8>, usize)> {
    let mut guard = tail
        .lock()
        .map_err(|_| anyhow!("output buffer lock poisoned"))?;
    Ok(std::mem::take(&mut *guard).into_parts())
}

/// Copy `reader` into `tail` until EOF, echoing to stdout when asked.
fn drain_into<R: Read>(mut reader: R, tail: &Mutex<TailBuffer>, echo: Echo) -> Result<()> {
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read output"),
        };
        if echo == Echo::Stdout {
            let mut out = std::io::stdout().lock();
            if let Err(e) = out.write_all(&chunk[..n]).and_then(|()| out.flush()) {
                warn!(err = %e, "failed to echo output");
            }
        }
        tail.lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?
            .push(&chunk[..n]);
    }
}

/// Read a raw stream to EOF, keeping the last `limit` bytes.
pub(crate) fn read_stream_tail<R: Read>(reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let tail = Mutex::new(TailBuffer::new(limit));
    drain_into(reader, &tail, Echo::Quiet)?;
    let tail = tail
        .into_inner()
        .map_err(|_| anyhow!("output buffer lock poisoned"))?;
    Ok(tail.into_parts())
}
