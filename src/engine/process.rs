// Encoder subprocess supervision: spawn, timeout, kill, stderr triage

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::command::{EncodeCommand, FFMPEG_BIN};

/// How often blocked waits re-check the cancel flag and deadlines.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stderr bytes surfaced on unclassified failures.
const STDERR_TAIL_BYTES: usize = 500;

/// Shared shutdown flag. Cloned into every blocking point so a signal turns
/// every wait into a prompt return.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Registry of live encoder PIDs, shared with the signal handler so shutdown
/// can terminate every child without asking the workers.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: u32) {
        self.pids.lock().unwrap().insert(pid);
    }

    fn unregister(&self, pid: u32) {
        self.pids.lock().unwrap().remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.pids.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate every registered child: SIGTERM first so ffmpeg can close
    /// its output, SIGKILL for anything still alive after the grace window.
    /// Returns the number of processes signaled.
    pub fn terminate_all(&self) -> usize {
        let pids_vec: Vec<u32> = {
            let pids = self.pids.lock().unwrap();
            pids.iter().copied().collect()
        };
        let count = pids_vec.len();

        for &pid in &pids_vec {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        // Up to 2 seconds of grace, checked every 100ms.
        for _ in 0..20 {
            thread::sleep(POLL_INTERVAL);
            let all_dead = pids_vec
                .iter()
                .all(|&pid| unsafe { libc::kill(pid as i32, 0) != 0 });
            if all_dead {
                return count;
            }
        }

        for &pid in &pids_vec {
            unsafe {
                if libc::kill(pid as i32, 0) == 0 {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
        }

        count
    }
}

/// Why a single encoder invocation failed. The pipeline keys its recovery
/// decisions off these kinds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("source stream looks corrupt: {0}")]
    DecodeCorruption(String),

    #[error("encoder unavailable: {0}")]
    MissingEncoder(String),

    #[error("pixel format conversion impossible: {0}")]
    FormatMismatch(String),

    #[error("encoder timed out after {0}s")]
    Timeout(u64),

    #[error("shutdown requested")]
    Cancelled,

    #[error("failed to launch encoder: {0}")]
    Spawn(String),

    #[error("encoder failed: {0}")]
    Other(String),
}

impl AttemptError {
    pub fn is_decode_corruption(&self) -> bool {
        matches!(self, AttemptError::DecodeCorruption(_))
    }
}

/// Markers ffmpeg prints when the *input* is damaged, as opposed to the
/// encoder being missing or misconfigured. Matched case-insensitively.
const DECODE_CORRUPTION_MARKERS: [&str; 5] = [
    "invalid data found when processing input",
    "error while decoding",
    "corrupt",
    "non monotonically increasing dts",
    "invalid timestamps",
];

const MISSING_ENCODER_MARKERS: [&str; 4] = [
    "unknown encoder",
    "no such filter",
    "cannot load nvcuda",
    "no nvenc capable devices",
];

const FORMAT_MISMATCH_MARKERS: [&str; 1] = ["impossible to convert between the formats"];

/// Does this stderr text indicate damaged source packets?
pub fn is_decode_corruption(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    DECODE_CORRUPTION_MARKERS.iter().any(|m| lower.contains(m))
}

/// Classify a non-zero ffmpeg exit from its stderr.
pub fn classify_stderr(status: &ExitStatus, stderr: &str) -> AttemptError {
    let lower = stderr.to_lowercase();

    if MISSING_ENCODER_MARKERS.iter().any(|m| lower.contains(m)) {
        return AttemptError::MissingEncoder(stderr_tail(stderr));
    }
    if FORMAT_MISMATCH_MARKERS.iter().any(|m| lower.contains(m)) {
        return AttemptError::FormatMismatch(stderr_tail(stderr));
    }
    if is_decode_corruption(stderr) {
        return AttemptError::DecodeCorruption(stderr_tail(stderr));
    }
    AttemptError::Other(format!("exit {status}: {}", stderr_tail(stderr)))
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let start = trimmed.len() - STDERR_TAIL_BYTES;
    // Avoid splitting a UTF-8 sequence.
    let mut idx = start;
    while !trimmed.is_char_boundary(idx) {
        idx += 1;
    }
    trimmed[idx..].to_string()
}

/// Wait for a child with a deadline, polling so the caller keeps ownership.
/// Returns `Ok(None)` on deadline expiry with the child still running.
pub fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Removes the PID from the table on every exit path.
struct PidGuard<'a> {
    table: &'a ProcessTable,
    pid: u32,
}

impl Drop for PidGuard<'_> {
    fn drop(&mut self) {
        self.table.unregister(self.pid);
    }
}

/// Runs encoder subprocesses under a shared process table and cancel token.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    table: ProcessTable,
    cancel: CancelToken,
}

impl ProcessRunner {
    pub fn new(table: ProcessTable, cancel: CancelToken) -> Self {
        Self { table, cancel }
    }

    /// Run one encode attempt to completion, enforcing the given timeout and
    /// the shared cancel token. stdout is drained and discarded; stderr is
    /// drained for triage.
    pub fn run(&self, cmd: &EncodeCommand, timeout: Duration) -> Result<(), AttemptError> {
        if self.cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }

        let mut child = Command::new(FFMPEG_BIN)
            .args(cmd.to_argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AttemptError::Spawn(e.to_string()))?;

        let pid = child.id();
        self.table.register(pid);
        let _guard = PidGuard {
            table: &self.table,
            pid,
        };

        // Both pipes must be drained or a chatty child deadlocks on a full
        // pipe buffer.
        let stdout = child.stdout.take();
        let stdout_thread = thread::spawn(move || {
            if let Some(out) = stdout {
                let mut reader = BufReader::new(out);
                let mut sink = Vec::new();
                reader.read_to_end(&mut sink).ok();
            }
        });

        let stderr = child.stderr.take();
        let stderr_thread = thread::spawn(move || {
            let mut collected = String::new();
            if let Some(err) = stderr {
                let reader = BufReader::new(err);
                for line in reader.lines().map_while(Result::ok) {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    child.kill().ok();
                    child.wait().ok();
                    return Err(AttemptError::Other(format!("wait failed: {e}")));
                }
            }

            if self.cancel.is_cancelled() {
                debug!(pid, "killing encoder: shutdown requested");
                child.kill().ok();
                child.wait().ok();
                stdout_thread.join().ok();
                stderr_thread.join().ok();
                return Err(AttemptError::Cancelled);
            }

            if Instant::now() >= deadline {
                warn!(pid, "killing encoder: timeout after {}s", timeout.as_secs());
                child.kill().ok();
                child.wait().ok();
                stdout_thread.join().ok();
                stderr_thread.join().ok();
                return Err(AttemptError::Timeout(timeout.as_secs()));
            }

            thread::sleep(POLL_INTERVAL);
        };

        stdout_thread.join().ok();
        let stderr_output = stderr_thread.join().unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(classify_stderr(&status, &stderr_output))
        }
    }
}

/// Per-attempt timeout scaled from the probed duration: 10x real time,
/// clamped to [5 minutes, 2 hours]. Unknown durations count as 30 s of video.
pub fn dynamic_timeout(duration_s: f64) -> Duration {
    let base = if duration_s > 0.0 { duration_s } else { 30.0 };
    let secs = ((base * 10.0) as u64).clamp(300, 7200);
    Duration::from_secs(secs)
}
