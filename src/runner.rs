use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{DroverError, PartialOutput};

/// Bytes per pipe read.
const READ_CHUNK_SIZE: usize = 8192;

/// Chunk preview length for logging. Full buffers are never logged.
const PREVIEW_BYTES: usize = 160;

/// Heartbeat diagnostics period.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Idle expiry is checked on this tick against `last_output_at`.
const IDLE_CHECK_PERIOD: Duration = Duration::from_millis(500);

/// Grace between the graceful-terminate and forced-kill signals.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Window past the hard deadline in which an exit event must be observed.
const SAFETY_GRACE: Duration = Duration::from_secs(5);

/// Drain window for trailing buffered bytes after a normal exit.
const FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Drain window for partial output after the termination protocol ran.
const KILL_DRAIN: Duration = Duration::from_millis(250);

/// One invocation of an external binary.
///
/// Arguments are an argument vector, never a shell string. `idle_timeout`
/// must not exceed `hard_timeout`; it is clamped if it does.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub hard_timeout: Duration,
    pub idle_timeout: Duration,
    pub cancel: Option<CancellationToken>,
}

/// Produced exactly once per invocation. `exit_code` is `None` when the
/// child died on a signal.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl InvocationOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Read-only view of the invocation gate, for diagnostics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStatus {
    pub max_concurrent: usize,
    pub available: usize,
    pub in_use: usize,
}

/// Drop guard that kills the entire process group (not just the leader PID).
///
/// The child is spawned as a process group leader (via `process_group(0)`)
/// and may spawn grandchildren. Killing only the leader PID leaves those as
/// orphans; this guard signals the negative PID so the whole tree goes.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

enum Stop {
    Exited,
    HardTimeout,
    IdleTimeout,
    OutputTooLarge,
    Cancelled,
    WaitFailed(std::io::Error),
}

/// Executes one external-binary invocation under supervision.
///
/// Guarantees: no leaked child processes or descendants, bounded parallelism
/// via a process-wide semaphore, partial output preserved across timeouts,
/// and oversized output aborts the invocation.
pub struct CommandRunner {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    max_output_bytes: usize,
    worker_home: Option<PathBuf>,
    worker_debug: bool,
}

impl CommandRunner {
    pub fn new(
        max_concurrent: usize,
        max_output_bytes: usize,
        worker_home: Option<PathBuf>,
        worker_debug: bool,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            max_output_bytes,
            worker_home,
            worker_debug,
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        let available = self.semaphore.available_permits();
        QueueStatus {
            max_concurrent: self.max_concurrent,
            available,
            in_use: self.max_concurrent - available,
        }
    }

    /// Execute one invocation and return its outcome.
    ///
    /// The concurrency permit is held for the whole call and released on
    /// every terminal path, including timeouts and the safety path, exactly
    /// once (RAII).
    pub async fn execute(&self, inv: Invocation) -> Result<InvocationOutcome, DroverError> {
        let _permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let status = self.queue_status();
                tracing::info!(
                    in_use = status.in_use,
                    max = status.max_concurrent,
                    program = %inv.program.display(),
                    "all invocation slots busy — waiting for a slot"
                );
                self.semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| DroverError::Other(format!("invocation gate closed: {e}")))?
            }
        };

        let idle_timeout = inv.idle_timeout.min(inv.hard_timeout);
        if idle_timeout < inv.idle_timeout {
            tracing::warn!("idle timeout exceeds hard timeout — clamped");
        }

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&inv.working_directory)
            .process_group(0);
        if let Some(ref home) = self.worker_home {
            cmd.env("HOME", home);
        }
        if self.worker_debug {
            cmd.env("DEBUG", "1");
        }

        let mut child = cmd.spawn().map_err(|e| DroverError::Spawn {
            executable: inv.program.display().to_string(),
            message: e.to_string(),
        })?;

        let _pg_guard = ProcessGroupGuard::new(child.id());
        let child_pid = child.id();

        // Pipe readers push chunks to the supervising loop so it can track
        // last-output time and the running size without buffering all of it
        // in one read_to_end.
        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");
        let (tx, mut rx) = mpsc::channel::<(OutputStream, Vec<u8>)>(64);
        spawn_reader(stdout_pipe, OutputStream::Stdout, tx.clone());
        spawn_reader(stderr_pipe, OutputStream::Stderr, tx);

        let cancel = inv.cancel.clone().unwrap_or_default();
        let start = Instant::now();
        let hard_deadline = start + inv.hard_timeout;
        let safety_deadline = hard_deadline + SAFETY_GRACE;

        let mut stdout_buf: Vec<u8> = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();
        let mut last_output_at: Option<Instant> = None;
        let mut last_beat_bytes = 0usize;
        let mut pipes_open = true;
        let mut exit_status: Option<ExitStatus> = None;
        let mut completed = false;

        let mut heartbeat =
            tokio::time::interval_at((start + HEARTBEAT_PERIOD).into(), HEARTBEAT_PERIOD);
        let mut idle_check = tokio::time::interval(IDLE_CHECK_PERIOD);

        let stop = loop {
            tokio::select! {
                biased;

                // Output first: bytes observed before a terminator fires must
                // land in the buffers.
                chunk = rx.recv(), if pipes_open => {
                    match chunk {
                        Some((stream, bytes)) => {
                            last_output_at = Some(Instant::now());
                            tracing::debug!(
                                stream = ?stream,
                                len = bytes.len(),
                                preview = %preview(&bytes),
                                "output chunk"
                            );
                            match stream {
                                OutputStream::Stdout => stdout_buf.extend_from_slice(&bytes),
                                OutputStream::Stderr => stderr_buf.extend_from_slice(&bytes),
                            }
                            let total = stdout_buf.len() + stderr_buf.len();
                            if total > self.max_output_bytes {
                                // Keep exactly max_output_bytes: the buffer
                                // that just grew absorbs the excess.
                                let overflow = total - self.max_output_bytes;
                                let buf = match stream {
                                    OutputStream::Stdout => &mut stdout_buf,
                                    OutputStream::Stderr => &mut stderr_buf,
                                };
                                let keep = buf.len().saturating_sub(overflow);
                                buf.truncate(keep);
                                break Stop::OutputTooLarge;
                            }
                            // A child that never stops talking must not
                            // starve the timer arms.
                            if Instant::now() >= hard_deadline {
                                break Stop::HardTimeout;
                            }
                        }
                        None => {
                            pipes_open = false;
                        }
                    }
                }

                status = child.wait(), if exit_status.is_none() => {
                    match status {
                        Ok(s) => {
                            exit_status = Some(s);
                            // Set before any timer cleanup so a heartbeat tick
                            // racing the exit observes completion.
                            completed = true;
                            break Stop::Exited;
                        }
                        Err(e) => break Stop::WaitFailed(e),
                    }
                }

                _ = cancel.cancelled() => break Stop::Cancelled,

                _ = tokio::time::sleep_until(hard_deadline.into()) => break Stop::HardTimeout,

                _ = idle_check.tick() => {
                    // Armed only once at least one byte has been observed:
                    // silence before first output is buffering, not a hang.
                    if let Some(t) = last_output_at
                        && t.elapsed() > idle_timeout
                    {
                        break Stop::IdleTimeout;
                    }
                }

                _ = heartbeat.tick() => {
                    if !completed {
                        let total = stdout_buf.len() + stderr_buf.len();
                        tracing::info!(
                            elapsed_s = start.elapsed().as_secs(),
                            total_bytes = total,
                            delta_bytes = total - last_beat_bytes,
                            hard_remaining_s = hard_deadline
                                .saturating_duration_since(Instant::now())
                                .as_secs(),
                            idle_remaining_s = last_output_at
                                .map(|t| (idle_timeout.saturating_sub(t.elapsed())).as_secs()),
                            "invocation heartbeat"
                        );
                        last_beat_bytes = total;
                    }
                }
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;

        match stop {
            Stop::Exited => {
                // Short flush so trailing buffered bytes arrive before the
                // outcome is produced.
                drain_chunks(&mut rx, &mut stdout_buf, &mut stderr_buf, FLUSH_DELAY).await;
                let total = stdout_buf.len() + stderr_buf.len();
                if total > self.max_output_bytes {
                    let overflow = total - self.max_output_bytes;
                    let keep = stdout_buf.len().saturating_sub(overflow);
                    stdout_buf.truncate(keep);
                    return Err(DroverError::OutputTooLarge {
                        limit: self.max_output_bytes,
                        partial: partial_from(&stdout_buf, &stderr_buf),
                    });
                }

                let status = exit_status.expect("exit status observed");
                let exit_code = status.code();
                let mut stdout = String::from_utf8_lossy(&stdout_buf).to_string();
                let mut stderr = String::from_utf8_lossy(&stderr_buf).to_string();
                // Trim only on success.
                if exit_code == Some(0) {
                    stdout = stdout.trim().to_string();
                    stderr = stderr.trim().to_string();
                }
                if !status.success() {
                    tracing::warn!(
                        program = %inv.program.display(),
                        code = exit_code,
                        elapsed_ms,
                        "invocation exited non-zero"
                    );
                }
                Ok(InvocationOutcome {
                    exit_code,
                    stdout,
                    stderr,
                })
            }

            Stop::OutputTooLarge => {
                terminate_process_group(&mut child, child_pid).await;
                // Output beyond the cap is not wanted; do not drain more.
                tracing::warn!(
                    program = %inv.program.display(),
                    limit = self.max_output_bytes,
                    "invocation terminated: output cap exceeded"
                );
                Err(DroverError::OutputTooLarge {
                    limit: self.max_output_bytes,
                    partial: partial_from(&stdout_buf, &stderr_buf),
                })
            }

            Stop::HardTimeout => {
                let mut exit_observed = terminate_process_group(&mut child, child_pid).await;
                if !exit_observed {
                    // Safety window: an exit event must show up within
                    // hard + 5s, or the machinery has failed and the call is
                    // resolved synthetically so the slot is never stuck (the
                    // permit is force released by dropping it on return).
                    exit_observed =
                        tokio::time::timeout_at(safety_deadline.into(), child.wait())
                            .await
                            .is_ok();
                }
                drain_chunks(&mut rx, &mut stdout_buf, &mut stderr_buf, KILL_DRAIN).await;
                if !exit_observed {
                    tracing::error!(
                        program = %inv.program.display(),
                        elapsed_ms,
                        "safety timeout: exit event never observed after the hard kill"
                    );
                    return Err(DroverError::SafetyTimeout {
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        partial: partial_from(&stdout_buf, &stderr_buf),
                    });
                }
                tracing::warn!(
                    program = %inv.program.display(),
                    elapsed_ms,
                    "invocation terminated: hard timeout"
                );
                Err(DroverError::HardTimeout {
                    elapsed_ms,
                    partial: partial_from(&stdout_buf, &stderr_buf),
                })
            }

            Stop::IdleTimeout => {
                terminate_process_group(&mut child, child_pid).await;
                drain_chunks(&mut rx, &mut stdout_buf, &mut stderr_buf, KILL_DRAIN).await;
                let idle_ms = idle_timeout.as_millis() as u64;
                tracing::warn!(
                    program = %inv.program.display(),
                    idle_ms,
                    elapsed_ms,
                    "invocation terminated: idle timeout"
                );
                Err(DroverError::IdleTimeout {
                    idle_ms,
                    partial: partial_from(&stdout_buf, &stderr_buf),
                })
            }

            Stop::Cancelled => {
                terminate_process_group(&mut child, child_pid).await;
                drain_chunks(&mut rx, &mut stdout_buf, &mut stderr_buf, KILL_DRAIN).await;
                tracing::info!(program = %inv.program.display(), elapsed_ms, "invocation cancelled");
                Err(DroverError::Cancelled {
                    partial: partial_from(&stdout_buf, &stderr_buf),
                })
            }

            Stop::WaitFailed(e) => {
                terminate_process_group(&mut child, child_pid).await;
                Err(DroverError::Other(format!(
                    "failed to wait on {}: {e}",
                    inv.program.display()
                )))
            }
        }
    }
}

fn spawn_reader<R>(mut pipe: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, Vec<u8>)>)
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    if tx.send((stream, buf)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(stream = ?stream, "pipe read error: {e}");
                    break;
                }
            }
        }
    });
}

/// Collect whatever chunks arrive within `window` into the buffers.
async fn drain_chunks(
    rx: &mut mpsc::Receiver<(OutputStream, Vec<u8>)>,
    stdout_buf: &mut Vec<u8>,
    stderr_buf: &mut Vec<u8>,
    window: Duration,
) {
    let deadline = Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline.into(), rx.recv()).await {
            Ok(Some((stream, bytes))) => match stream {
                OutputStream::Stdout => stdout_buf.extend_from_slice(&bytes),
                OutputStream::Stderr => stderr_buf.extend_from_slice(&bytes),
            },
            Ok(None) | Err(_) => break,
        }
    }
}

/// Termination protocol: graceful signal to the group, a grace period, then
/// a forced kill of the group, and always a direct-child kill as fallback.
/// The forced kill is skipped when the child exits within the grace window.
/// Returns whether the exit event was observed.
async fn terminate_process_group(child: &mut Child, pid: Option<u32>) -> bool {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
    let mut exited = tokio::time::timeout(KILL_GRACE, child.wait())
        .await
        .is_ok();
    if !exited && let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
    if !exited {
        exited = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .is_ok();
    }
    exited
}

fn partial_from(stdout_buf: &[u8], stderr_buf: &[u8]) -> PartialOutput {
    PartialOutput {
        stdout: String::from_utf8_lossy(stdout_buf).to_string(),
        stderr: String::from_utf8_lossy(stderr_buf).to_string(),
    }
}

/// First bytes of a chunk with newlines escaped, for logging.
fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(PREVIEW_BYTES);
    String::from_utf8_lossy(&bytes[..end])
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}
