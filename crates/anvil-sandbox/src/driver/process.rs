//! Child-process runner shared by the local and container drivers.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::outcome::{ExecutionOutcome, TailBuffer};

/// How long to keep draining pipes after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Everything observed about one child process.
#[derive(Debug)]
pub(crate) struct ProcessRun {
    pub stdout: String,
    pub stderr: String,
    pub status: Option<std::process::ExitStatus>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessRun {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Standard mapping: deadline hit, clean exit, or abnormal exit.
    pub fn into_outcome(self, limit: Duration) -> ExecutionOutcome {
        if self.timed_out {
            return ExecutionOutcome::timed_out(self.stdout, limit, self.duration);
        }
        match self.status {
            Some(status) if status.success() => {
                ExecutionOutcome::success(self.stdout, self.duration)
            }
            Some(status) => {
                let message = failure_message(&self.stderr, status);
                ExecutionOutcome::runtime_error(self.stdout, message, self.duration)
            }
            None => ExecutionOutcome::infrastructure(
                "child exit status unavailable",
                self.duration,
            ),
        }
    }
}

/// Prefer the stderr tail; fall back to describing the exit status.
pub(crate) fn failure_message(stderr: &str, status: std::process::ExitStatus) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    describe_status(status)
}

fn describe_status(status: std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return format!("process killed by signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("process exited with status {code}"),
        None => "process exited abnormally".to_string(),
    }
}

/// Spawn `command` in its own process group, feed `stdin`, and wait until it
/// exits or `timeout` elapses. The whole group is killed once the leader is
/// gone, whether it exited or hit the deadline.
///
/// The timer starts once the child is spawned.
pub(crate) async fn run_with_deadline(
    mut command: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_cap: usize,
) -> std::io::Result<ProcessRun> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let started = Instant::now();
    let pid = child.id();

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            if let Err(err) = pipe.write_all(&bytes).await {
                debug!(error = %err, "failed to write child stdin");
            }
            // Dropping the pipe closes it and signals EOF.
            let _ = pipe.shutdown().await;
        });
    }

    let stdout_sink = Arc::new(Mutex::new(TailBuffer::new(output_cap)));
    let stderr_sink = Arc::new(Mutex::new(TailBuffer::new(output_cap)));
    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(pump(pipe, stdout_sink.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(pump(pipe, stderr_sink.clone())));

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (Some(status?), false),
        Err(_elapsed) => {
            kill_process_group(pid);
            let _ = child.start_kill();
            (child.wait().await.ok(), true)
        }
    };
    let duration = started.elapsed();
    // Background descendants must not outlive the run.
    kill_process_group(pid);

    drain(stdout_task).await;
    drain(stderr_task).await;

    Ok(ProcessRun {
        stdout: take_tail(&stdout_sink, output_cap),
        stderr: take_tail(&stderr_sink, output_cap),
        status,
        timed_out,
        duration,
    })
}

/// Run a short probe command and report whether it exited successfully
/// within `limit`. Output is discarded.
pub(crate) async fn probe(program: &str, args: &[&str], limit: Duration) -> bool {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let Ok(mut child) = command.spawn() else {
        return false;
    };
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(_)) => false,
        Err(_elapsed) => {
            let _ = child.start_kill();
            false
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<TailBuffer>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut tail) = sink.lock() {
                    tail.push(&chunk[..n]);
                }
            }
        }
    }
}

/// Give a pipe reader a short grace period; grandchildren that escaped the
/// process group may keep the pipe open forever.
async fn drain(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn take_tail(sink: &Arc<Mutex<TailBuffer>>, cap: usize) -> String {
    match sink.lock() {
        Ok(mut tail) => std::mem::replace(&mut *tail, TailBuffer::new(cap)).into_string(),
        Err(_) => String::new(),
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %err, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
