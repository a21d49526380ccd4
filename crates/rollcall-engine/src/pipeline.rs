//! Bounded frame queue and worker pool feeding the recorder thread.
//!
//! ```text
//! submit ──▶ FrameQueue (drop-oldest) ──▶ N workers ──▶ Sequencer ──▶ recorder thread ──▶ ledger
//! ```
//!
//! Workers finish out of order; the sequencer hands their candidates to the
//! recorder in submission order, so the deduplicator sees frames in the
//! order they were captured.
//!
//! A frame that waited in the queue past its deadline, or whose processing
//! overran it, is dropped as a missed observation. The first storage failure
//! stops the recorder; workers then stop and `shutdown` returns the error.

use crate::processor::{FrameProcessor, ProcessError};
use crate::recorder::{spawn_recorder, RecorderError, RecorderHandle, RecorderStats, RecorderThread, SessionRecorder};
use crate::types::{CandidateMatch, Frame, SessionId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is shut down")]
    Closed,
    #[error("recorder: {0}")]
    Recorder(#[from] RecorderError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("frame worker panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub frame_deadline: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 32,
            frame_deadline: Duration::from_millis(2000),
        }
    }
}

pub struct Job {
    pub session: SessionId,
    pub frame: Frame,
    /// Submission position, used to restore order after processing.
    ticket: u64,
    enqueued: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queue was full; the oldest waiting frame was discarded.
    DroppedOldest,
}

struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
    next_ticket: u64,
}

/// Bounded MPMC queue that favours fresh frames: on overflow the oldest
/// waiting frame is dropped.
pub struct FrameQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
                next_ticket: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Queue state stays consistent across a panicking holder.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, session: SessionId, frame: Frame) -> Result<Enqueued, PipelineError> {
        Ok(match self.push_evicting(session, frame)? {
            Some(_) => Enqueued::DroppedOldest,
            None => Enqueued::Queued,
        })
    }

    /// Push and return the job evicted to make room, if any.
    fn push_evicting(&self, session: SessionId, frame: Frame) -> Result<Option<Job>, PipelineError> {
        let mut state = self.state();
        if state.closed {
            return Err(PipelineError::Closed);
        }
        let mut evicted = None;
        if state.jobs.len() >= self.capacity {
            if let Some(old) = state.jobs.pop_front() {
                tracing::warn!(source = %old.frame.source, sequence = old.frame.sequence, "frame queue full; dropping oldest");
                evicted = Some(old);
            }
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.jobs.push_back(Job {
            session,
            frame,
            ticket,
            enqueued: Instant::now(),
        });
        drop(state);
        self.ready.notify_one();
        Ok(evicted)
    }

    /// Next job, blocking while the queue is empty. `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<Job> {
        let mut state = self.state();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Stop accepting frames; queued frames are still handed out.
    pub fn close(&self) {
        self.state().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Batch = (SessionId, Vec<CandidateMatch>);

/// Reorder buffer between the workers and the recorder. Every ticket the
/// queue hands out is completed exactly once, by a worker or on eviction.
struct Sequencer {
    handle: RecorderHandle,
    state: Mutex<Reorder>,
}

#[derive(Default)]
struct Reorder {
    next: u64,
    done: BTreeMap<u64, Option<Batch>>,
}

impl Sequencer {
    fn new(handle: RecorderHandle) -> Self {
        Self {
            handle,
            state: Mutex::new(Reorder::default()),
        }
    }

    /// Record the outcome of `ticket` and forward every batch that is now
    /// next in line. Forwarding happens under the lock so batches reach the
    /// recorder in ticket order.
    fn complete(&self, ticket: u64, batch: Option<Batch>) -> Result<(), RecorderError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.done.insert(ticket, batch);
        loop {
            let next = state.next;
            let Some(ready) = state.done.remove(&next) else {
                break;
            };
            state.next += 1;
            if let Some((session, candidates)) = ready {
                self.handle.submit_blocking(session, candidates)?;
            }
        }
        Ok(())
    }

    /// Completed results still waiting for an earlier ticket.
    fn waiting(&self) -> usize {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).done.len()
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_deadline: AtomicU64,
    failed: AtomicU64,
    processed: AtomicU64,
    candidates: AtomicU64,
    skipped_regions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_deadline: self.dropped_deadline.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            skipped_regions: self.skipped_regions.load(Ordering::Relaxed),
            recorder: RecorderStats::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub dropped_overflow: u64,
    pub dropped_deadline: u64,
    /// Frames that failed to decode or match.
    pub failed: u64,
    pub processed: u64,
    pub candidates: u64,
    pub skipped_regions: u64,
    pub recorder: RecorderStats,
}

pub struct Pipeline {
    queue: Arc<FrameQueue>,
    sequencer: Arc<Sequencer>,
    counters: Arc<Counters>,
    workers: Vec<JoinHandle<()>>,
    handle: RecorderHandle,
    recorder: RecorderThread,
}

impl Pipeline {
    pub fn spawn(
        processor: Arc<FrameProcessor>,
        recorder: SessionRecorder,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let queue = Arc::new(FrameQueue::new(config.queue_capacity));
        let counters = Arc::new(Counters::default());
        let (handle, recorder) = spawn_recorder(recorder, config.queue_capacity)?;
        let sequencer = Arc::new(Sequencer::new(handle.clone()));

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for index in 0..config.workers.max(1) {
            let worker = Worker {
                queue: queue.clone(),
                counters: counters.clone(),
                processor: processor.clone(),
                sequencer: sequencer.clone(),
                deadline: config.frame_deadline,
            };
            let join = std::thread::Builder::new()
                .name(format!("rollcall-worker-{index}"))
                .spawn(move || worker.run());
            match join {
                Ok(join) => workers.push(join),
                Err(err) => {
                    queue.close();
                    return Err(err.into());
                }
            }
        }

        tracing::info!(
            workers = workers.len(),
            queue_capacity = config.queue_capacity,
            deadline_ms = config.frame_deadline.as_millis() as u64,
            "pipeline started"
        );
        Ok(Self {
            queue,
            sequencer,
            counters,
            workers,
            handle,
            recorder,
        })
    }

    /// Queue a frame for `session`. A full queue drops its oldest frame
    /// instead of waiting. Call from a plain thread: releasing the dropped
    /// frame's slot may forward buffered results to the recorder.
    pub fn submit(&self, session: SessionId, frame: Frame) -> Result<Enqueued, PipelineError> {
        let evicted = self.queue.push_evicting(session, frame)?;
        Counters::bump(&self.counters.submitted, 1);
        let Some(old) = evicted else {
            return Ok(Enqueued::Queued);
        };
        Counters::bump(&self.counters.dropped_overflow, 1);
        self.sequencer.complete(old.ticket, None)?;
        Ok(Enqueued::DroppedOldest)
    }

    /// Frames currently waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handle for session control and direct candidate submission.
    pub fn handle(&self) -> RecorderHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Drain queued frames, stop the workers and the recorder.
    ///
    /// Blocking; call from a plain thread (or `spawn_blocking`). Returns the
    /// recorder's storage failure if it stopped on one.
    pub fn shutdown(self) -> Result<PipelineStats, PipelineError> {
        let Pipeline {
            queue,
            sequencer,
            counters,
            workers,
            handle,
            recorder,
        } = self;
        queue.close();
        let mut panicked = false;
        for worker in workers {
            panicked |= worker.join().is_err();
        }
        let mut stats = counters.snapshot();
        let stranded = sequencer.waiting();
        if stranded > 0 {
            tracing::warn!(stranded, "frame results never forwarded to the recorder");
        }
        handle.stop_blocking();
        stats.recorder = recorder.join()?;
        if panicked {
            return Err(PipelineError::WorkerPanicked);
        }
        tracing::info!(?stats, "pipeline stopped");
        Ok(stats)
    }
}

struct Worker {
    queue: Arc<FrameQueue>,
    counters: Arc<Counters>,
    processor: Arc<FrameProcessor>,
    sequencer: Arc<Sequencer>,
    deadline: Duration,
}

impl Worker {
    fn run(self) {
        while let Some(job) = self.queue.pop() {
            let batch = self.handle(&job);
            if self.sequencer.complete(job.ticket, batch).is_err() {
                tracing::error!("recorder gone; frame worker stopping");
                self.queue.close();
                break;
            }
        }
    }

    /// Candidates to forward for one job, or `None` when the frame is dropped
    /// or yields nothing.
    fn handle(&self, job: &Job) -> Option<Batch> {
        let waited = job.enqueued.elapsed();
        if waited > self.deadline {
            tracing::warn!(frame = job.frame.sequence, waited_ms = waited.as_millis() as u64, "frame missed deadline in queue");
            Counters::bump(&self.counters.dropped_deadline, 1);
            return None;
        }

        let result = match self.processor.process(&job.frame) {
            Ok(result) => result,
            Err(err) => {
                match &err {
                    ProcessError::FrameDecode { .. } => tracing::warn!(error = %err, "frame skipped"),
                    _ => tracing::error!(error = %err, "frame processing failed"),
                }
                Counters::bump(&self.counters.failed, 1);
                return None;
            }
        };

        if job.enqueued.elapsed() > self.deadline {
            tracing::warn!(frame = job.frame.sequence, "frame processing overran deadline");
            Counters::bump(&self.counters.dropped_deadline, 1);
            return None;
        }

        Counters::bump(&self.counters.processed, 1);
        Counters::bump(&self.counters.candidates, result.candidates.len() as u64);
        Counters::bump(&self.counters.skipped_regions, result.skipped_regions as u64);
        if result.candidates.is_empty() {
            return None;
        }
        Some((job.session, result.candidates))
    }
}
