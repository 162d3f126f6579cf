//! External tool invocation
//!
//! Wraps `tokio::process` with the control surface the pipeline needs:
//! line-by-line stderr streaming, suspend/resume via signals, and a
//! per-job slot that holds the control handle of the one subprocess a
//! job is allowed to have running at a time.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Number of trailing stderr lines kept for error reporting.
const TAIL_LINES: usize = 40;

/// Error type for subprocess execution
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The external binary is not on PATH
    #[error("External tool {0:?} was not found; is it installed?")]
    ToolMissing(String),

    /// The process was deliberately killed through its control handle
    #[error("Process was killed before it finished")]
    Killed,

    /// The tool ran but exited with a failure status
    #[error("{tool} exited with status {code}: {detail}")]
    NonZeroExit {
        tool: String,
        code: i32,
        detail: String,
    },

    /// Spawn or wait failed at the OS level
    #[error("Process IO error: {0}")]
    Io(#[from] io::Error),
}

/// A fully-resolved command line for an external tool
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: S, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn ffmpeg(args: Vec<String>) -> Self {
        Self::new("ffmpeg", args)
    }

    /// Shell-style rendering for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Exit status of a completed tool run
#[derive(Debug, Clone, Copy)]
pub struct ExitSummary {
    pub code: i32,
}

/// Handle used to suspend, resume, or kill a running tool.
///
/// Cloneable so the pipeline can park it in the job's active slot while
/// the spawning stage keeps streaming output.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: u32,
    killed: Arc<AtomicBool>,
}

/// Whether this platform can suspend a running subprocess.
///
/// Signal-based suspension only exists on unix; elsewhere a job that has
/// started its encode cannot be paused mid-process, only between stages.
pub fn can_suspend() -> bool {
    cfg!(unix)
}

impl ProcessControl {
    /// Stop the process without terminating it (SIGSTOP).
    pub fn suspend(&self) -> io::Result<()> {
        self.signal(SIG_STOP)
    }

    /// Resume a suspended process (SIGCONT).
    pub fn resume(&self) -> io::Result<()> {
        self.signal(SIG_CONT)
    }

    /// Kill the process. The eventual wait reports `ProcessError::Killed`
    /// instead of a spurious exit status.
    pub fn terminate(&self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.signal(SIG_KILL)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    #[cfg(unix)]
    fn signal(&self, sig: i32) -> io::Result<()> {
        // Safety: plain kill(2) on a pid we spawned ourselves.
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _sig: i32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process signals are not supported on this platform",
        ))
    }
}

#[cfg(unix)]
const SIG_STOP: i32 = libc::SIGSTOP;
#[cfg(unix)]
const SIG_CONT: i32 = libc::SIGCONT;
#[cfg(unix)]
const SIG_KILL: i32 = libc::SIGKILL;

#[cfg(not(unix))]
const SIG_STOP: i32 = 0;
#[cfg(not(unix))]
const SIG_CONT: i32 = 0;
#[cfg(not(unix))]
const SIG_KILL: i32 = 0;

/// A spawned external tool with streamed stderr.
///
/// ffmpeg and friends write all diagnostics and progress to stderr, so
/// stdout is discarded and stderr is the line stream.
pub struct ToolProcess {
    program: String,
    child: tokio::process::Child,
    control: ProcessControl,
    lines: mpsc::UnboundedReceiver<String>,
    reader: JoinHandle<String>,
}

impl ToolProcess {
    pub fn spawn(spec: &CommandSpec) -> Result<Self, ProcessError> {
        tracing::debug!(command = %spec.command_line(), "spawning external tool");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    ProcessError::ToolMissing(spec.program.clone())
                } else {
                    ProcessError::Io(e)
                }
            })?;

        let pid = child.id().ok_or_else(|| {
            ProcessError::Io(io::Error::other("spawned process exited before pid read"))
        })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::Io(io::Error::other("stderr pipe missing")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
                // Receiver may be dropped by callers that only want the exit
                // status; keep draining so the child never blocks on stderr.
                let _ = tx.send(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        Ok(Self {
            program: spec.program.clone(),
            child,
            control: ProcessControl {
                pid,
                killed: Arc::new(AtomicBool::new(false)),
            },
            lines: rx,
            reader,
        })
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    /// Next stderr line, or `None` once the stream closes at exit.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Reap the process.
    ///
    /// A deliberate kill surfaces as `Killed` no matter what status the OS
    /// reports; death by signal without a kill request does too.
    pub async fn wait(mut self) -> Result<ExitSummary, ProcessError> {
        let status = self.child.wait().await?;
        let tail = self.reader.await.unwrap_or_default();

        if self.control.was_killed() {
            return Err(ProcessError::Killed);
        }
        match status.code() {
            Some(0) => Ok(ExitSummary { code: 0 }),
            Some(code) => Err(ProcessError::NonZeroExit {
                tool: self.program,
                code,
                detail: tail,
            }),
            None => Err(ProcessError::Killed),
        }
    }
}

/// The one-subprocess slot a job owns.
///
/// Pause/resume/stop requests race against stage transitions; the slot is
/// the rendezvous point. At most one control handle is registered at a
/// time.
#[derive(Debug, Clone, Default)]
pub struct ActiveSlot {
    inner: Arc<Mutex<Option<ProcessControl>>>,
}

impl ActiveSlot {
    pub fn register(&self, control: ProcessControl) {
        let mut slot = self.inner.lock().expect("active slot lock");
        debug_assert!(slot.is_none(), "job spawned a second concurrent process");
        *slot = Some(control);
    }

    pub fn clear(&self) {
        *self.inner.lock().expect("active slot lock") = None;
    }

    pub fn suspend_active(&self) {
        if let Some(control) = self.inner.lock().expect("active slot lock").as_ref() {
            if let Err(e) = control.suspend() {
                tracing::warn!(error = %e, "failed to suspend active process");
            }
        }
    }

    pub fn resume_active(&self) {
        if let Some(control) = self.inner.lock().expect("active slot lock").as_ref() {
            if let Err(e) = control.resume() {
                tracing::warn!(error = %e, "failed to resume active process");
            }
        }
    }

    pub fn terminate_active(&self) {
        if let Some(control) = self.inner.lock().expect("active slot lock").as_ref() {
            if let Err(e) = control.terminate() {
                tracing::warn!(error = %e, "failed to kill active process");
            }
        }
    }
}
