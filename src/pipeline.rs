//! Local shell pipelines for bind-mount storage
//!
//! Bind snapshots are archived and extracted on the host by a small shell
//! pipeline (`tar | pigz > file`, `gzip -dc < file | tar x`). This module
//! runs such pipelines with three guarantees:
//!
//! - paths are passed as positional parameters (`"$1"`, `"$2"`), never
//!   interpolated into the script text
//! - the shell runs with `pipefail` when bash is available, so a failing
//!   `tar` is not masked by a succeeding compressor
//! - the shell leads its own process group, so cancellation reaches every
//!   process of the pipeline, not just the shell
//!
//! Output is not logged line by line. The last [`TAIL_LINES`] lines are kept
//! for error reports and a summary is logged every [`LOG_EVERY`] lines.

use crate::error::{FailureHint, Result, SnapshotError};
use crate::utils;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Number of output lines kept for diagnostics
pub const TAIL_LINES: usize = 150;
/// Output lines between progress log summaries
pub const LOG_EVERY: u64 = 500;

const POLL: Duration = Duration::from_millis(100);

const OUT_OF_SPACE: [&str; 3] = ["no space left on device", "enospc", "disk quota exceeded"];

/// Bounded tail of a pipeline's combined output
#[derive(Debug)]
pub struct DiagnosticTail {
    stage: String,
    lines: VecDeque<String>,
    total: u64,
}

impl DiagnosticTail {
    /// Empty tail for `stage`
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            lines: VecDeque::with_capacity(TAIL_LINES),
            total: 0,
        }
    }

    /// Record one output line
    pub fn push(&mut self, line: String) {
        if self.lines.len() == TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.total += 1;
        if self.total % LOG_EVERY == 0 {
            info!(stage = %self.stage, "{} entries processed", self.total);
        }
    }

    /// Lines seen so far
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Retained lines joined with newlines
    pub fn text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Failure cause detectable from the retained lines
    pub fn hint(&self) -> Option<FailureHint> {
        self.lines
            .iter()
            .any(|line| {
                let lower = line.to_lowercase();
                OUT_OF_SPACE.iter().any(|p| lower.contains(p))
            })
            .then_some(FailureHint::InsufficientSpace)
    }

    /// Build the error for a failed run
    pub fn into_error(self, code: Option<i32>) -> SnapshotError {
        let hint = self.hint();
        SnapshotError::Pipeline {
            code,
            tail: self.text(),
            hint,
            stage: self.stage,
        }
    }
}

/// Compressor available on the host: `pigz` when installed, else `gzip`
pub fn compressor() -> &'static str {
    if which::which("pigz").is_ok() {
        "pigz"
    } else {
        "gzip"
    }
}

/// A shell script plus positional arguments
#[derive(Debug, Clone)]
pub struct ShellPipeline {
    stage: String,
    script: String,
    args: Vec<OsString>,
    grace: Duration,
}

impl ShellPipeline {
    /// Pipeline labelled `stage` running `script`
    pub fn new(stage: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            script: script.into(),
            args: Vec::new(),
            grace: Duration::from_millis(1500),
        }
    }

    /// Archive the contents of `source` into `output`, gzip-compressed
    pub fn archive(stage: impl Into<String>, source: &Path, output: &Path) -> Self {
        let script = format!("tar cvf - -C \"$1\" . | {} > \"$2\"", compressor());
        Self::new(stage, script).arg(source).arg(output)
    }

    /// Extract `archive` into `destination`
    ///
    /// Permissions are preserved, ownership is not.
    pub fn extract(stage: impl Into<String>, archive: &Path, destination: &Path, compressed: bool) -> Self {
        let script = if compressed {
            format!(
                "{} -dc < \"$1\" | tar xpvf - --no-same-owner -C \"$2\"",
                compressor()
            )
        } else {
            "tar xpvf \"$1\" --no-same-owner -C \"$2\"".to_string()
        };
        Self::new(stage, script).arg(archive).arg(destination)
    }

    /// Append a positional argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Wait between SIGTERM and SIGKILL on cancellation
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Stage label
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Script text, without the `pipefail` prefix
    pub fn script(&self) -> &str {
        &self.script
    }

    fn command(&self) -> Command {
        let mut cmd = match which::which("bash") {
            Ok(bash) => {
                let mut cmd = Command::new(bash);
                cmd.arg("-c").arg(format!("set -o pipefail; {}", self.script));
                cmd
            }
            Err(_) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&self.script);
                cmd
            }
        };
        // $0, then "$1".. for the positional args
        cmd.arg(&self.stage).args(&self.args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        cmd
    }

    /// Start the pipeline
    pub fn spawn(&self) -> Result<RunningPipeline> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| SnapshotError::internal(format!("failed to spawn {}: {}", self.stage, e)))?;
        info!(stage = %self.stage, pid = child.id(), "Started pipeline: {}", self.script);

        let tail = Arc::new(Mutex::new(DiagnosticTail::new(self.stage.clone())));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Arc::clone(&tail)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Arc::clone(&tail)));
        }

        Ok(RunningPipeline {
            stage: self.stage.clone(),
            child,
            tail,
            readers,
            grace: self.grace,
        })
    }

    /// Spawn and wait, honoring `cancel`
    pub fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.spawn()?.wait(cancel)
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: R, tail: Arc<Mutex<DiagnosticTail>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    tail.lock().push(line);
                }
            }
        }
    })
}

/// A started pipeline
#[derive(Debug)]
pub struct RunningPipeline {
    stage: String,
    child: Child,
    tail: Arc<Mutex<DiagnosticTail>>,
    readers: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl RunningPipeline {
    /// Pid of the shell, which is also the process group id
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Wait for exit, terminating the process group if `cancel` fires
    ///
    /// # Errors
    ///
    /// - [`SnapshotError::Cancelled`] when cancelled
    /// - [`SnapshotError::Pipeline`] with the diagnostic tail on a non-zero exit
    pub fn wait(mut self, cancel: &CancellationToken) -> Result<()> {
        let status = loop {
            if cancel.is_cancelled() {
                warn!(stage = %self.stage, "Cancelling pipeline {}", self.pid());
                self.terminate();
                self.join_readers();
                return Err(SnapshotError::Cancelled(self.stage.clone()));
            }
            match self.child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL),
            }
        };
        self.join_readers();
        self.finish(status)
    }

    fn finish(self, status: ExitStatus) -> Result<()> {
        let tail = std::mem::replace(&mut *self.tail.lock(), DiagnosticTail::new(self.stage.clone()));

        if status.success() {
            info!(stage = %self.stage, "Pipeline finished ({} output lines)", tail.total());
            return Ok(());
        }

        let err = tail.into_error(status.code());
        error!(
            stage = %self.stage,
            "Pipeline failed: {}\n{}",
            err,
            err.diagnostic_tail().unwrap_or_default()
        );
        Err(err)
    }

    fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }

    /// SIGTERM the process group, then SIGKILL after the grace period
    pub fn terminate(&mut self) {
        let pgid = self.pid();
        signal_group(pgid, Signal::SIGTERM);
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                // leader gone, make sure stragglers in the group are too
                signal_group(pgid, Signal::SIGKILL);
                return;
            }
            thread::sleep(POLL);
        }
        warn!(stage = %self.stage, "Pipeline {} ignored SIGTERM, killing", pgid);
        signal_group(pgid, Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

fn signal_group(pgid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!("killpg({}, {:?}): {}", pgid, signal, e);
    }
}

/// Terminate a process group this process did not spawn
///
/// Used for bind pipelines left running by a previous engine process.
pub fn terminate_process_group(pgid: u32, grace: Duration) {
    if !utils::is_pid_alive(pgid) {
        return;
    }
    info!("Terminating orphaned pipeline group {}", pgid);
    signal_group(pgid, Signal::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !utils::is_pid_alive(pgid) {
            return;
        }
        thread::sleep(POLL);
    }
    signal_group(pgid, Signal::SIGKILL);
}
