//! Encode queue
//!
//! Single-flight FIFO scheduler: jobs are admitted in order, exactly one
//! processes at a time, and terminal jobs land in the finished or failed
//! list. Pause, resume, and stop delegate to the active job; a stopped
//! job fails and the queue promotes the next one.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};

use hevconv_config::EncodeOptions;

use crate::context::JobContext;
use crate::pipeline::{Job, JobEvent, JobStatus};

/// Error type for queue control operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is already running")]
    AlreadyRunning,

    #[error("Queue is already paused")]
    AlreadyPaused,

    #[error("Queue is not running")]
    NotRunning,
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Running,
    Paused,
}

/// Events the queue emits for observers
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    /// A job was admitted
    Queued { id: u64, path: PathBuf },
    /// A job was promoted to the processing slot
    Processing { id: u64, name: String },
    /// Forwarded event from the active job
    Job(JobEvent),
    Paused,
    Resumed,
    /// The queue ran out of pending jobs; names of failed jobs so far
    Drained { failed: Vec<String> },
}

struct Inner {
    pending: VecDeque<Job>,
    current: Option<(u64, JobContext)>,
    finished: Vec<Job>,
    failed: Vec<Job>,
    next_id: u64,
    drained_reported: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    state: watch::Sender<QueueState>,
    kick: Notify,
    events: mpsc::UnboundedSender<EncoderEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EncoderEvent>>>,
    watch_ignore: Arc<Mutex<Vec<PathBuf>>>,
}

/// The encode queue handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Encoder {
    shared: Arc<Shared>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    pending: VecDeque::new(),
                    current: None,
                    finished: Vec::new(),
                    failed: Vec::new(),
                    next_id: 1,
                    drained_reported: false,
                }),
                state: watch::channel(QueueState::Idle).0,
                kick: Notify::new(),
                events,
                events_rx: Mutex::new(Some(events_rx)),
                watch_ignore: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Admit a file to the back of the queue.
    ///
    /// Ids are handed out by the queue itself, monotonically from 1.
    pub fn enqueue(&self, path: PathBuf, options: EncodeOptions) -> io::Result<u64> {
        std::fs::metadata(&path)?;
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.pending.push_back(Job::new(id, path.clone(), options));
            id
        };
        tracing::info!(job = id, path = %path.display(), "queued");
        let _ = self.shared.events.send(EncoderEvent::Queued { id, path });
        // a running-but-drained loop promotes the new job immediately
        self.shared.kick.notify_one();
        Ok(id)
    }

    /// Start processing, or resume from a pause.
    pub fn start(&self) -> Result<(), QueueError> {
        // copy the state out; holding the watch read guard across
        // send_replace would deadlock
        let state = *self.shared.state.borrow();
        match state {
            QueueState::Running => Err(QueueError::AlreadyRunning),
            QueueState::Paused => self.resume(),
            QueueState::Idle => {
                self.shared.state.send_replace(QueueState::Running);
                let shared = Arc::clone(&self.shared);
                tokio::spawn(work_loop(shared));
                Ok(())
            }
        }
    }

    /// Suspend the active job and stop promoting new ones.
    pub fn pause(&self) -> Result<(), QueueError> {
        let state = *self.shared.state.borrow();
        match state {
            QueueState::Paused => Err(QueueError::AlreadyPaused),
            QueueState::Idle => Err(QueueError::NotRunning),
            QueueState::Running => {
                if let Some((id, ctx)) = self.current_context() {
                    tracing::info!(job = id, "pausing active job");
                    ctx.pause();
                }
                self.shared.state.send_replace(QueueState::Paused);
                let _ = self.shared.events.send(EncoderEvent::Paused);
                Ok(())
            }
        }
    }

    /// Wake a paused queue and its suspended job.
    pub fn resume(&self) -> Result<(), QueueError> {
        let state = *self.shared.state.borrow();
        match state {
            QueueState::Running => Err(QueueError::AlreadyRunning),
            QueueState::Idle => Err(QueueError::NotRunning),
            QueueState::Paused => {
                if let Some((id, ctx)) = self.current_context() {
                    tracing::info!(job = id, "resuming active job");
                    ctx.resume();
                }
                self.shared.state.send_replace(QueueState::Running);
                let _ = self.shared.events.send(EncoderEvent::Resumed);
                Ok(())
            }
        }
    }

    /// Stop the active job. It fails with a premature-stop cause and the
    /// queue moves on to the next pending job.
    pub fn stop(&self) -> Result<(), QueueError> {
        if *self.shared.state.borrow() == QueueState::Idle {
            return Err(QueueError::NotRunning);
        }
        let Some((id, ctx)) = self.current_context() else {
            return Err(QueueError::NotRunning);
        };
        tracing::info!(job = id, "stopping active job");
        ctx.stop();
        // a job paused mid-process still has to observe the stop
        if *self.shared.state.borrow() == QueueState::Paused {
            self.shared.state.send_replace(QueueState::Running);
        }
        Ok(())
    }

    pub fn state(&self) -> QueueState {
        *self.shared.state.borrow()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn finished_count(&self) -> usize {
        self.lock().finished.len()
    }

    pub fn is_processing(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Failed jobs so far as (display name, cause) pairs.
    pub fn failed_summary(&self) -> Vec<(String, String)> {
        self.lock()
            .failed
            .iter()
            .map(|job| {
                let cause = job
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                (job.display_name(), cause)
            })
            .collect()
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EncoderEvent>> {
        self.shared
            .events_rx
            .lock()
            .expect("events lock")
            .take()
    }

    /// Check whether a path was produced by this queue and should be
    /// skipped by a directory watcher. A hit consumes the entry.
    pub fn claim_watch_ignore(&self, path: &Path) -> bool {
        let mut ignored = self
            .shared
            .watch_ignore
            .lock()
            .expect("watch ignore lock");
        match ignored.iter().position(|p| p == path) {
            Some(index) => {
                ignored.remove(index);
                true
            }
            None => false,
        }
    }

    fn current_context(&self) -> Option<(u64, JobContext)> {
        self.lock().current.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.inner.lock().expect("queue lock")
    }
}

async fn work_loop(shared: Arc<Shared>) {
    loop {
        // park while paused
        let mut state_rx = shared.state.subscribe();
        loop {
            // copy the state so no read guard is held across the await
            let state = *state_rx.borrow_and_update();
            match state {
                QueueState::Running => break,
                QueueState::Idle => return,
                QueueState::Paused => {
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        }

        let next = shared.inner.lock().expect("queue lock").pending.pop_front();
        let Some(mut job) = next else {
            let drained = {
                let mut inner = shared.inner.lock().expect("queue lock");
                if inner.drained_reported {
                    None
                } else {
                    inner.drained_reported = true;
                    Some(inner.failed.iter().map(Job::display_name).collect::<Vec<_>>())
                }
            };
            if let Some(failed) = drained {
                tracing::info!("queue drained");
                let _ = shared.events.send(EncoderEvent::Drained { failed });
            }
            shared.kick.notified().await;
            continue;
        };

        let ctx = JobContext::new();
        {
            let mut inner = shared.inner.lock().expect("queue lock");
            inner.drained_reported = false;
            inner.current = Some((job.id, ctx.clone()));
        }
        let _ = shared.events.send(EncoderEvent::Processing {
            id: job.id,
            name: job.display_name(),
        });

        // forward job events into the queue stream
        let (job_events, mut job_events_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn({
            let events = shared.events.clone();
            async move {
                while let Some(event) = job_events_rx.recv().await {
                    let _ = events.send(EncoderEvent::Job(event));
                }
            }
        });

        job.run(&ctx, &job_events, &shared.watch_ignore).await;

        drop(job_events);
        let _ = forwarder.await;

        let mut inner = shared.inner.lock().expect("queue lock");
        inner.current = None;
        match job.status {
            JobStatus::Finished => inner.finished.push(job),
            _ => inner.failed.push(job),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn wait_for_drain(rx: &mut mpsc::UnboundedReceiver<EncoderEvent>) -> Vec<String> {
        loop {
            let event = timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("queue should drain in time")
                .expect("event stream open");
            if let EncoderEvent::Drained { failed } = event {
                return failed;
            }
        }
    }

    #[test]
    fn test_enqueue_requires_an_existing_file() {
        let encoder = Encoder::new();
        let err = encoder
            .enqueue(PathBuf::from("/no/such/file.mkv"), EncodeOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let dir = tempdir().expect("tempdir");
        let a = dir.path().join("a.avi");
        let b = dir.path().join("b.avi");
        std::fs::write(&a, b"not a real video").expect("write");
        std::fs::write(&b, b"not a real video").expect("write");

        let encoder = Encoder::new();
        let first = encoder.enqueue(a, EncodeOptions::default()).expect("enqueue");
        let second = encoder.enqueue(b, EncodeOptions::default()).expect("enqueue");
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(encoder.pending_count(), 2);
    }

    #[test]
    fn test_control_errors_before_start() {
        let encoder = Encoder::new();
        assert_eq!(encoder.pause(), Err(QueueError::NotRunning));
        assert_eq!(encoder.resume(), Err(QueueError::NotRunning));
        assert_eq!(encoder.stop(), Err(QueueError::NotRunning));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let encoder = Encoder::new();
        encoder.start().expect("first start");
        assert_eq!(encoder.start(), Err(QueueError::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_pause_twice_is_rejected() {
        let encoder = Encoder::new();
        encoder.start().expect("start");
        encoder.pause().expect("pause");
        assert_eq!(encoder.pause(), Err(QueueError::AlreadyPaused));
        encoder.resume().expect("resume");
        assert_eq!(encoder.resume(), Err(QueueError::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_empty_queue_drains_immediately() {
        let encoder = Encoder::new();
        let mut events = encoder.take_events().expect("first take");
        assert!(encoder.take_events().is_none());

        encoder.start().expect("start");
        let failed = wait_for_drain(&mut events).await;
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn test_jobs_process_in_fifo_order() {
        let dir = tempdir().expect("tempdir");
        let names = ["a.avi", "b.avi", "c.avi"];
        let encoder = Encoder::new();
        let mut events = encoder.take_events().expect("events");
        for name in names {
            let path = dir.path().join(name);
            std::fs::write(&path, b"junk bytes, not video").expect("write");
            encoder.enqueue(path, EncodeOptions::default()).expect("enqueue");
        }

        encoder.start().expect("start");
        let mut processed = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(30), events.recv())
                .await
                .expect("drains in time")
                .expect("stream open");
            match event {
                EncoderEvent::Processing { name, .. } => processed.push(name),
                EncoderEvent::Drained { .. } => break,
                _ => {}
            }
        }
        assert_eq!(processed, names);
        // junk inputs cannot probe; every job fails but the queue kept going
        assert_eq!(encoder.failed_summary().len(), 3);
        assert_eq!(encoder.finished_count(), 0);
        assert!(!encoder.is_processing());
    }

    #[tokio::test]
    async fn test_late_enqueue_is_promoted_by_a_running_queue() {
        let dir = tempdir().expect("tempdir");
        let encoder = Encoder::new();
        let mut events = encoder.take_events().expect("events");
        encoder.start().expect("start");
        let _ = wait_for_drain(&mut events).await;

        let path = dir.path().join("late.avi");
        std::fs::write(&path, b"junk").expect("write");
        encoder.enqueue(path, EncodeOptions::default()).expect("enqueue");

        // no second start() needed
        let failed = wait_for_drain(&mut events).await;
        assert_eq!(failed, vec!["late.avi".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_fails_active_job_and_promotes_next() {
        // the first job must still be in flight when the stop lands, so
        // this needs a real ffprobe for the job to be suspended on
        if std::process::Command::new("ffprobe").arg("-version").output().is_err() {
            return;
        }

        let dir = tempdir().expect("tempdir");
        let a = dir.path().join("a.avi");
        let b = dir.path().join("b.avi");
        std::fs::write(&a, b"junk bytes, not video").expect("write");
        std::fs::write(&b, b"junk bytes, not video").expect("write");

        let encoder = Encoder::new();
        let mut events = encoder.take_events().expect("events");
        encoder.enqueue(a, EncodeOptions::default()).expect("enqueue");
        encoder.enqueue(b, EncodeOptions::default()).expect("enqueue");
        encoder.start().expect("start");

        let mut processed = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(30), events.recv())
                .await
                .expect("drains in time")
                .expect("stream open");
            match event {
                EncoderEvent::Processing { name, .. } => {
                    // on this current-thread runtime the worker cannot
                    // advance between recv() and stop(), so the stop
                    // always hits the job while it is active
                    if name == "a.avi" {
                        encoder.stop().expect("stop active job");
                    }
                    processed.push(name);
                }
                EncoderEvent::Drained { .. } => break,
                _ => {}
            }
        }

        assert_eq!(processed, vec!["a.avi".to_string(), "b.avi".to_string()]);
        let failed = encoder.failed_summary();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].0, "a.avi");
        assert!(
            failed[0].1.to_lowercase().contains("stopped"),
            "stopped job reported cause {:?}",
            failed[0].1
        );
        assert!(!encoder.is_processing());
    }

    #[test]
    fn test_watch_ignore_claims_consume_entries() {
        let encoder = Encoder::new();
        let path = PathBuf::from("/media/out.mkv");
        encoder
            .shared
            .watch_ignore
            .lock()
            .expect("lock")
            .push(path.clone());

        assert!(encoder.claim_watch_ignore(&path));
        assert!(!encoder.claim_watch_ignore(&path));
    }
}
