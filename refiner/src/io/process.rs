//! Helpers for running child processes with deadlines and bounded output.
//!
//! On Unix every child leads its own process group, and the whole group is
//! killed once the child exits, when the deadline passes, and when the
//! caller drops the future. Background processes started by the child
//! therefore never outlive the call.

use std::mem;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// How long to keep draining pipes once the child has exited. A process
/// outside the group holding a pipe open must not stall the caller.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    /// Last `max_chars` characters of stderr, trimmed.
    pub fn stderr_tail(&self, max_chars: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let text = text.trim();
        let count = text.chars().count();
        if count <= max_chars {
            return text.to_string();
        }
        let tail: String = text.chars().skip(count - max_chars).collect();
        format!("...{tail}")
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child is killed on timeout, and also if the returned future is dropped early.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes = output_limit_bytes))]
pub async fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let mut group = ProcessGroup::new(child.id());

    let writer = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            Some(tokio::spawn(async move {
                if let Err(err) = child_stdin.write_all(&input).await {
                    debug!(err = %err, "child closed stdin before reading all input");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_sink = SharedCapture::default();
    let stderr_sink = SharedCapture::default();
    let stdout_handle = tokio::spawn(read_stream_limited(
        stdout,
        output_limit_bytes,
        Arc::clone(&stdout_sink),
    ));
    let stderr_handle = tokio::spawn(read_stream_limited(
        stderr,
        output_limit_bytes,
        Arc::clone(&stderr_sink),
    ));

    let mut timed_out = false;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.context("wait for command")?,
        Err(_) => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "command timed out, killing"
            );
            timed_out = true;
            group.kill();
            child.kill().await.context("kill command")?;
            child.wait().await.context("wait command after kill")?
        }
    };
    let elapsed = started.elapsed();
    group.kill();

    if let Some(writer) = writer {
        writer.abort();
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle, &stdout_sink)
        .await
        .context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle, &stderr_sink)
        .await
        .context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// The process group led by a spawned child. Killed at most once, and on drop.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(err = %err, pgid, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Bytes read from one pipe so far, shared with its reader task.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

fn take_captured(sink: &SharedCapture) -> (Vec<u8>, usize) {
    let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
    (mem::take(&mut captured.bytes), captured.truncated)
}

/// Wait for a reader to reach EOF. A reader still blocked after
/// [`DRAIN_GRACE`] is abandoned, keeping whatever it had already read.
async fn join_output(
    handle: JoinHandle<Result<()>>,
    sink: &SharedCapture,
) -> Result<(Vec<u8>, usize)> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(result)) => result?,
        Ok(Err(err)) => return Err(anyhow!("output reader task failed: {err}")),
        Err(_) => {
            abort.abort();
            warn!("output pipe still open after child exit, abandoning it");
        }
    }
    Ok(take_captured(sink))
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    sink: SharedCapture,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_stdin() {
        let output = run_command_with_timeout(
            sh("cat; echo done >&2"),
            Some(b"hello".to_vec()),
            Duration::from_secs(5),
            1024,
        )
        .await
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.stderr_tail(100), "done");
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 10"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .await
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn truncates_output_beyond_limit() {
        let output = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(5),
            4,
        )
        .await
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[tokio::test]
    async fn background_processes_die_with_the_child() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30 & printf ok"),
            None,
            Duration::from_secs(5),
            1024,
        )
        .await
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"ok");
        assert!(started.elapsed() < DRAIN_GRACE, "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn abandoned_reader_keeps_bytes_already_read() {
        let sink = SharedCapture::default();
        {
            let mut captured = sink.lock().expect("lock");
            captured.bytes.extend_from_slice(b"TRANSFORM_RESULT:[]\n");
            captured.truncated = 3;
        }
        let stalled = tokio::spawn(std::future::pending::<Result<()>>());
        let (bytes, truncated) = join_output(stalled, &sink).await.expect("join");
        assert_eq!(bytes, b"TRANSFORM_RESULT:[]\n");
        assert_eq!(truncated, 3);
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        use std::os::unix::process::ExitStatusExt;
        let output = CommandOutput {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: b"  first line\nlast line\n".to_vec(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
            elapsed: Duration::ZERO,
        };
        assert_eq!(output.stderr_tail(9), "...last line");
    }
}
