//! Per-job execution context
//!
//! Carries the control state a running job shares with its scheduler:
//! the pause gate stages wait on, the stop flag, and the slot holding
//! the control handle of the currently running subprocess.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::PipelineError;
use crate::process::{ActiveSlot, CommandSpec, ProcessError, ToolProcess};

/// Barrier a paused job parks on between stages.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            paused: Arc::new(watch::channel(false).0),
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn release(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open. Returns immediately when not paused.
    pub async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Shared control surface for one running job.
#[derive(Debug, Clone)]
pub struct JobContext {
    slot: ActiveSlot,
    gate: PauseGate,
    stopped: Arc<AtomicBool>,
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new()
    }
}

impl JobContext {
    pub fn new() -> Self {
        Self {
            slot: ActiveSlot::default(),
            gate: PauseGate::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Suspend the live subprocess (if any) and close the stage gate.
    pub fn pause(&self) {
        self.gate.pause();
        self.slot.suspend_active();
    }

    /// Reopen the stage gate and wake the suspended subprocess.
    pub fn resume(&self) {
        self.slot.resume_active();
        self.gate.release();
    }

    /// Kill the live subprocess and mark the job stopped. The gate is
    /// released so a job paused between stages can observe the stop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.slot.terminate_active();
        self.gate.release();
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stage boundary: park while paused, then bail out if stopped.
    pub async fn checkpoint(&self) -> Result<(), PipelineError> {
        self.gate.wait_while_paused().await;
        if self.is_stopped() {
            return Err(PipelineError::StoppedPrematurely);
        }
        Ok(())
    }

    /// Spawn a tool, register it in the active slot, and collect its
    /// stderr to completion.
    ///
    /// A pause that lands before the spawn still takes hold: the fresh
    /// process is suspended immediately after registration.
    pub async fn run_collect(&self, spec: &CommandSpec) -> Result<Vec<String>, ProcessError> {
        if self.is_stopped() {
            return Err(ProcessError::Killed);
        }

        let mut proc = ToolProcess::spawn(spec)?;
        self.register(&proc);

        let mut lines = Vec::new();
        while let Some(line) = proc.next_line().await {
            lines.push(line);
        }
        let result = proc.wait().await;
        self.slot.clear();
        result.map(|_| lines)
    }

    /// Register a spawned process in the active slot, applying any pause
    /// or stop that raced the spawn.
    pub fn register(&self, proc: &ToolProcess) {
        let control = proc.control();
        self.slot.register(control.clone());
        if self.is_stopped() {
            let _ = control.terminate();
        } else if self.gate.is_paused() {
            let _ = control.suspend();
        }
    }

    /// Drop the active slot registration after a process is reaped.
    pub fn clear_active(&self) {
        self.slot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkpoint_passes_when_idle() {
        let ctx = JobContext::new();
        ctx.checkpoint().await.expect("open gate");
    }

    #[tokio::test]
    async fn test_checkpoint_blocks_while_paused() {
        let ctx = JobContext::new();
        ctx.pause();
        let waiting = tokio::time::timeout(Duration::from_millis(50), ctx.checkpoint()).await;
        assert!(waiting.is_err(), "checkpoint should park while paused");

        ctx.resume();
        ctx.checkpoint().await.expect("gate reopened");
    }

    #[tokio::test]
    async fn test_stop_wakes_a_paused_checkpoint() {
        let ctx = JobContext::new();
        ctx.pause();
        let parked = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.checkpoint().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.stop();
        let outcome = parked.await.expect("task completes");
        assert!(matches!(outcome, Err(PipelineError::StoppedPrematurely)));
    }

    #[tokio::test]
    async fn test_run_collect_refuses_after_stop() {
        let ctx = JobContext::new();
        ctx.stop();
        let spec = CommandSpec::new("sh", vec!["-c".to_string(), "true".to_string()]);
        match ctx.run_collect(&spec).await {
            Err(ProcessError::Killed) => {}
            other => panic!("expected Killed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_collect_returns_lines() {
        let ctx = JobContext::new();
        let spec = CommandSpec::new(
            "sh",
            vec!["-c".to_string(), "echo alpha >&2; echo beta >&2".to_string()],
        );
        let lines = ctx.run_collect(&spec).await.expect("runs");
        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_a_running_collect() {
        let ctx = JobContext::new();
        let runner = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                let spec = CommandSpec::new("sleep", vec!["30".to_string()]);
                ctx.run_collect(&spec).await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.stop();
        match runner.await.expect("task completes") {
            Err(ProcessError::Killed) => {}
            other => panic!("expected Killed, got {other:?}"),
        }
    }
}
