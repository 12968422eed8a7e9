use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::constants::{CAPTURE_CEILING_BYTES, DEFAULT_SAMPLE_INTERVAL, PIPE_DRAIN_GRACE};
use crate::core::{
    domain::{RunRequest, RunResult, TerminationCause},
    traits::runner::Runner,
};
use crate::native::{group::ProcessGroup, memory};

/// Runs programs as local child processes, enforcing the time limit with a
/// deadline and the memory limit by sampling procfs for the whole process
/// group.
#[derive(Clone, Debug)]
pub struct NativeRunner {
    sample_interval: Duration,
}

impl NativeRunner {
    pub fn new() -> Self {
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    fn command(request: &RunRequest) -> Command {
        let mut cmd = Command::new(&request.command.program);
        cmd.args(&request.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.command.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn execute(&self, request: RunRequest) -> RunResult {
        let limits = request.limits;
        let start = Instant::now();

        let mut child = match Self::command(&request).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "failed to launch");
                return RunResult::launch_failed(format!(
                    "failed to launch `{}`: {e}",
                    request.command.program
                ));
            }
        };
        let pid = child.id();
        let group = ProcessGroup::new(pid);
        tracing::debug!(?pid, "launched");

        let writer = feed_input(&mut child, request.input);
        let overflowed = Arc::new(AtomicBool::new(false));
        let cap = capture_cap(limits.output_bytes());
        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(capture(pipe, cap, Some(overflowed.clone()))));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(capture(pipe, cap, None)));

        let deadline = start + limits.time();
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut peak: Option<u64> = None;
        let memory_breached = |peak: Option<u64>| peak.is_some_and(|p| p > limits.memory_bytes());

        let (cause, exit_code) = loop {
            tokio::select! {
                biased;
                status = child.wait() => {
                    break match status {
                        Ok(status) => classify_exit(status, memory_breached(peak), start.elapsed() > limits.time()),
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to wait for child");
                            (TerminationCause::Crashed { signal: None }, None)
                        }
                    };
                }
                _ = ticker.tick() => {
                    if let Some(pid) = pid {
                        peak = peak.max(memory::sample_group(pid).await);
                    }
                    if memory_breached(peak) {
                        break (TerminationCause::MemoryExceeded, None);
                    }
                    if overflowed.load(Ordering::Acquire) {
                        break (TerminationCause::OutputExceeded, None);
                    }
                }
                _ = &mut sleep => {
                    if let Some(pid) = pid {
                        peak = peak.max(memory::sample_group(pid).await);
                    }
                    if memory_breached(peak) {
                        break (TerminationCause::MemoryExceeded, None);
                    }
                    break (TerminationCause::TimeExceeded, None);
                }
            }
        };
        let elapsed = start.elapsed();

        group.kill();
        if let Err(e) = child.start_kill() {
            tracing::trace!(error = %e, "child already reaped");
        }
        if let Err(e) = child.wait().await {
            tracing::warn!(error = %e, "failed to reap child");
        }
        writer.abort();

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        // The reader may hit the cap only after the exit was observed.
        let (cause, exit_code) = match cause {
            TerminationCause::MemoryExceeded => (cause, exit_code),
            _ if overflowed.load(Ordering::Acquire) => (TerminationCause::OutputExceeded, None),
            _ => (cause, exit_code),
        };

        match &cause {
            TerminationCause::Completed => {
                tracing::debug!(?exit_code, elapsed_ms = elapsed.as_millis() as u64, "completed")
            }
            cause => tracing::info!(?cause, elapsed_ms = elapsed.as_millis() as u64, ?peak, "run terminated"),
        }

        RunResult {
            stdout,
            stderr,
            exit_code,
            execution_time_ms: elapsed.as_millis() as u64,
            peak_memory_usage_bytes: peak,
            cause,
        }
    }
}

impl Default for NativeRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Runner for NativeRunner {
    async fn run(&self, request: RunRequest) -> RunResult {
        let span = tracing::info_span!(
            "run",
            run_id = %request.id,
            command = %request.command,
            time_ms = request.limits.time_ms(),
            memory_bytes = request.limits.memory_bytes(),
        );
        self.execute(request).instrument(span).await
    }
}

/// Natural exit is still checked against the limits: a breach observed by the
/// last sample, or a deadline that passed before the exit was noticed, wins
/// over completion.
fn classify_exit(
    status: ExitStatus,
    memory_breached: bool,
    deadline_passed: bool,
) -> (TerminationCause, Option<i32>) {
    if memory_breached {
        return (TerminationCause::MemoryExceeded, None);
    }
    if deadline_passed {
        return (TerminationCause::TimeExceeded, None);
    }
    match status.code() {
        Some(code) => (TerminationCause::Completed, Some(code)),
        None => (TerminationCause::Crashed { signal: signal_of(status) }, None),
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

/// Writes the whole input then closes stdin so the child sees end-of-stream.
fn feed_input(child: &mut Child, input: Vec<u8>) -> JoinHandle<()> {
    let stdin = child.stdin.take();
    tokio::spawn(async move {
        let Some(mut stdin) = stdin else {
            return;
        };
        if let Err(e) = stdin.write_all(&input).await {
            // Candidates are free to exit without reading their input.
            tracing::debug!(error = %e, "stdin closed early");
        }
    })
}

/// Bytes kept per pipe. Without an output limit the capture ceiling still
/// applies.
fn capture_cap(output_bytes: Option<u64>) -> usize {
    let cap = output_bytes.map_or(CAPTURE_CEILING_BYTES, |bytes| bytes.min(CAPTURE_CEILING_BYTES));
    usize::try_from(cap).unwrap_or(usize::MAX)
}

/// Reads a pipe to its end, keeping at most `cap` bytes. With `overflow` set
/// the read stops at the cap and raises the flag; without it the excess is
/// drained and discarded so the child never blocks on a full pipe.
async fn capture<R>(mut pipe: R, cap: usize, overflow: Option<Arc<AtomicBool>>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "pipe read failed");
                break;
            }
        };
        let room = cap - buf.len();
        buf.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            if let Some(flag) = &overflow {
                flag.store(true, Ordering::Release);
                break;
            }
        }
    }
    buf
}

async fn drain(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "pipe reader failed");
            Vec::new()
        }
        Err(_) => {
            // Something outside the process group still holds the pipe open.
            abort.abort();
            tracing::warn!("pipe not closed after kill, output dropped");
            Vec::new()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::domain::{CommandSpec, ExecutionLimits};

    fn limits(time_ms: u64) -> ExecutionLimits {
        ExecutionLimits::new(time_ms, 512 * 1024 * 1024).unwrap()
    }

    async fn run_shell(script: &str, input: &str, limits: ExecutionLimits) -> RunResult {
        NativeRunner::new()
            .run(RunRequest::new(CommandSpec::shell(script), input, limits))
            .await
    }

    #[tokio::test]
    async fn test_echoes_input_until_eof() {
        let result = run_shell("cat", "3 4\n", limits(5000)).await;

        assert_eq!(result.cause, TerminationCause::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, b"3 4\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_still_completed() {
        let result = run_shell("echo oops >&2; exit 3", "", limits(5000)).await;

        assert_eq!(result.cause, TerminationCause::Completed);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr, b"oops\n");
    }

    #[tokio::test]
    async fn test_infinite_loop_hits_time_limit() {
        let started = std::time::Instant::now();
        let result = run_shell("while :; do :; done", "", limits(200)).await;

        assert_eq!(result.cause, TerminationCause::TimeExceeded);
        assert_eq!(result.exit_code, None);
        assert!(result.execution_time_ms >= 200);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_sleeping_child_is_killed_with_its_group() {
        let started = std::time::Instant::now();
        let result = run_shell("sleep 30 & sleep 30; wait", "", limits(200)).await;

        assert_eq!(result.cause, TerminationCause::TimeExceeded);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_launch() {
        let result = NativeRunner::new()
            .run(RunRequest::new(
                CommandSpec::new("/nonexistent/candidate"),
                "",
                limits(1000),
            ))
            .await;

        assert!(matches!(result.cause, TerminationCause::LaunchFailed { .. }));
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_signal_is_a_crash() {
        let result = run_shell("kill -SEGV $$", "", limits(5000)).await;

        assert_eq!(result.cause, TerminationCause::Crashed { signal: Some(11) });
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_output_cap() {
        let limits = limits(5000).with_output_bytes(Some(1024)).unwrap();
        let result = run_shell("yes", "", limits).await;

        assert_eq!(result.cause, TerminationCause::OutputExceeded);
        assert_eq!(result.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_large_input_is_fully_written() {
        let input = "x".repeat(1 << 20);
        let result = run_shell("wc -c", &input, limits(5000)).await;

        assert_eq!(result.cause, TerminationCause::Completed);
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "1048576");
    }

    #[tokio::test]
    async fn test_ignored_input_does_not_fail() {
        let input = "x".repeat(1 << 20);
        let result = run_shell("exit 0", &input, limits(5000)).await;

        assert_eq!(result.cause, TerminationCause::Completed);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_workdir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let command = CommandSpec::shell("pwd").workdir(dir.path());
        let result = NativeRunner::new()
            .run(RunRequest::new(command, "", limits(5000)))
            .await;

        let expected = dir.path().canonicalize().unwrap();
        let actual = std::path::PathBuf::from(String::from_utf8_lossy(&result.stdout).trim());
        assert_eq!(actual.canonicalize().unwrap(), expected);
    }

    // Grows a string to 64 MiB, then spins holding it.
    const ALLOCATE: &str =
        "awk 'BEGIN { s = \"x\"; while (length(s) < 67108864) s = s s; while (1) n++ }'";

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_hog_hits_memory_limit() {
        let limits = ExecutionLimits::new(10_000, 32 * 1024 * 1024).unwrap();
        let result = run_shell(&format!("exec {ALLOCATE}"), "", limits).await;

        assert_eq!(result.cause, TerminationCause::MemoryExceeded);
        assert!(result.peak_memory_usage_bytes.unwrap() > 32 * 1024 * 1024);
        assert!(result.execution_time_ms < 10_000);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_of_shell_children_counts() {
        let limits = ExecutionLimits::new(10_000, 32 * 1024 * 1024).unwrap();
        let result = run_shell(&format!("{ALLOCATE}; true"), "", limits).await;

        assert_eq!(result.cause, TerminationCause::MemoryExceeded);
        assert!(result.peak_memory_usage_bytes.unwrap() > 32 * 1024 * 1024);
        assert!(result.execution_time_ms < 10_000);
    }

    #[test]
    fn test_capture_is_always_bounded() {
        assert_eq!(capture_cap(Some(1024)), 1024);
        assert_eq!(capture_cap(None), CAPTURE_CEILING_BYTES as usize);
        assert_eq!(capture_cap(Some(u64::MAX)), CAPTURE_CEILING_BYTES as usize);
    }

    #[tokio::test]
    async fn test_capture_discards_excess_without_flag() {
        let data = vec![b'x'; 20_000];
        let kept = capture(&data[..], 100, None).await;

        assert_eq!(kept.len(), 100);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_peak_memory_is_recorded() {
        let result = run_shell("sleep 0.1", "", limits(5000)).await;

        assert_eq!(result.cause, TerminationCause::Completed);
        assert!(result.peak_memory_usage_bytes.is_some());
    }

    #[tokio::test]
    async fn test_abandoned_run_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        let script = format!("sleep 1; touch {}", marker.display());

        let run = run_shell(&script, "", limits(10_000));
        let _ = tokio::time::timeout(Duration::from_millis(100), run).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!marker.exists());
    }
}
