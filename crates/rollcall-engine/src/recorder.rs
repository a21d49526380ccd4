//! The single sequencing point between matching and the ledger.
//!
//! All candidates, session opens and session closes pass through one
//! [`SessionRecorder`], owned by one OS thread. That gives every session a
//! single serialized confirmation path and read-your-write semantics between
//! the deduplicator and the ledger. Frame workers and the CLI talk to the
//! thread through a [`RecorderHandle`].

use crate::dedup::{DedupConfig, Deduplicator, Observation};
use crate::ledger::{Ledger, LedgerError};
use crate::types::{AttendanceEvent, CandidateMatch, Session, SessionId};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("recorder stopped after a storage failure: {0}")]
    Stopped(String),
    #[error("recorder thread exited")]
    ChannelClosed,
    #[error("failed to spawn recorder thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("recorder thread panicked")]
    Panicked,
}

/// How often (in frame time) stale sessions are swept.
const SWEEP_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub candidates: u64,
    pub ignored: u64,
    pub events: u64,
    /// Confirmations the ledger already held or could no longer accept.
    pub absorbed: u64,
}

pub struct SessionRecorder {
    dedup: Deduplicator,
    ledger: Arc<Ledger>,
    session_timeout: Option<Duration>,
    latest: Option<DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
    stats: RecorderStats,
}

impl SessionRecorder {
    pub fn new(ledger: Arc<Ledger>, config: DedupConfig) -> Self {
        Self {
            dedup: Deduplicator::new(config),
            ledger,
            session_timeout: None,
            latest: None,
            last_sweep: None,
            stats: RecorderStats::default(),
        }
    }

    /// Auto-close sessions that stay open longer than `timeout`.
    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn open_session(&mut self, course: &str, at: DateTime<Utc>) -> Result<Session, LedgerError> {
        self.ledger.open_session(course, at)
    }

    pub fn close_session(&mut self, id: SessionId, at: DateTime<Utc>) -> Result<Session, LedgerError> {
        let session = self.ledger.close_session(id, at)?;
        let dropped = self.dedup.forget_session(id);
        tracing::debug!(session = %id, dropped, "presence state discarded");
        Ok(session)
    }

    /// Close sessions opened more than the configured timeout before `now`.
    pub fn close_stale(&mut self, now: DateTime<Utc>) -> Result<Vec<SessionId>, LedgerError> {
        let Some(timeout) = self.session_timeout else {
            return Ok(Vec::new());
        };
        let closed = self.ledger.close_stale_sessions(now - timeout, now)?;
        for id in &closed {
            tracing::info!(session = %id, "session timed out");
            self.dedup.forget_session(*id);
        }
        self.last_sweep = Some(now);
        Ok(closed)
    }

    /// Feed one frame's candidates through the deduplicator and write every
    /// resulting confirmation. Only storage failures are returned; expected
    /// races (duplicates, closed or unknown sessions) are logged and skipped.
    pub fn apply(
        &mut self,
        session: SessionId,
        candidates: &[CandidateMatch],
    ) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let mut events = Vec::new();
        for candidate in candidates {
            self.stats.candidates += 1;
            self.latest = Some(self.latest.map_or(candidate.observed_at, |l| l.max(candidate.observed_at)));

            let event = match self.dedup.observe(session, candidate) {
                Observation::Confirmed(event) => event,
                Observation::Ignored(_) => {
                    self.stats.ignored += 1;
                    continue;
                }
                Observation::Pending | Observation::Repeat => continue,
            };

            match self.ledger.record(&event) {
                Ok(()) => {
                    self.stats.events += 1;
                    events.push(event);
                }
                Err(err @ LedgerError::SessionClosed(_)) => {
                    tracing::debug!(%session, error = %err, "late confirmation dropped");
                    self.stats.absorbed += 1;
                    self.dedup.forget_session(session);
                }
                Err(err) if err.is_benign() => {
                    tracing::debug!(%session, error = %err, "confirmation absorbed");
                    self.stats.absorbed += 1;
                }
                Err(err @ (LedgerError::UnknownSession(_) | LedgerError::UnknownStudent(_))) => {
                    tracing::warn!(%session, error = %err, "confirmation dropped");
                    self.stats.absorbed += 1;
                }
                Err(err) => {
                    tracing::error!(%session, student = %event.student_id, error = %err, "failed to record attendance");
                    return Err(err);
                }
            }
        }

        self.housekeeping()?;
        Ok(events)
    }

    /// Expire stale pending sightings and sweep timed-out sessions, both
    /// driven by the newest frame time seen. Pending state is kept for one
    /// extra window so out-of-order frames can still corroborate it.
    fn housekeeping(&mut self) -> Result<(), LedgerError> {
        let Some(latest) = self.latest else {
            return Ok(());
        };
        self.dedup.expire(latest - self.dedup.config().stability_window);

        let due = self
            .last_sweep
            .map_or(true, |last| latest - last >= Duration::seconds(SWEEP_INTERVAL_SECS));
        if self.session_timeout.is_some() && due {
            self.close_stale(latest)?;
        }
        Ok(())
    }
}

enum RecorderRequest {
    Apply {
        session: SessionId,
        candidates: Vec<CandidateMatch>,
        reply: Option<oneshot::Sender<Result<Vec<AttendanceEvent>, RecorderError>>>,
    },
    Open {
        course: String,
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<Session, LedgerError>>,
    },
    Close {
        id: SessionId,
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<Session, LedgerError>>,
    },
    CloseStale {
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<Vec<SessionId>, LedgerError>>,
    },
    Stop,
}

/// Clone-safe handle to the recorder thread.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderRequest>,
}

impl RecorderHandle {
    /// Apply candidates and wait for the events they produced.
    pub async fn apply(&self, session: SessionId, candidates: Vec<CandidateMatch>) -> Result<Vec<AttendanceEvent>, RecorderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RecorderRequest::Apply {
                session,
                candidates,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| RecorderError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RecorderError::ChannelClosed)?
    }

    /// Fire-and-forget submission for frame workers (plain OS threads).
    /// Blocks while the channel is full.
    pub fn submit_blocking(&self, session: SessionId, candidates: Vec<CandidateMatch>) -> Result<(), RecorderError> {
        self.tx
            .blocking_send(RecorderRequest::Apply {
                session,
                candidates,
                reply: None,
            })
            .map_err(|_| RecorderError::ChannelClosed)
    }

    pub async fn open_session(&self, course: &str, at: DateTime<Utc>) -> Result<Session, RecorderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RecorderRequest::Open {
                course: course.to_string(),
                at,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RecorderError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| RecorderError::ChannelClosed)??)
    }

    pub async fn close_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<Session, RecorderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RecorderRequest::Close { id, at, reply: reply_tx })
            .await
            .map_err(|_| RecorderError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| RecorderError::ChannelClosed)??)
    }

    /// Ask the thread to exit after the requests already queued. Must not be
    /// called from inside an async context.
    pub fn stop_blocking(&self) {
        let _ = self.tx.blocking_send(RecorderRequest::Stop);
    }

    /// Close every session that exceeded the configured timeout.
    pub async fn close_stale(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>, RecorderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RecorderRequest::CloseStale { now, reply: reply_tx })
            .await
            .map_err(|_| RecorderError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| RecorderError::ChannelClosed)??)
    }
}

/// Join handle of the recorder thread.
pub struct RecorderThread {
    join: JoinHandle<Result<RecorderStats, LedgerError>>,
}

impl RecorderThread {
    /// Wait for the thread to finish. It exits on `stop_blocking`, once every
    /// handle is dropped, or on the first storage failure, which is returned
    /// here.
    pub fn join(self) -> Result<RecorderStats, RecorderError> {
        let outcome = self.join.join().map_err(|_| RecorderError::Panicked)?;
        Ok(outcome?)
    }
}

/// Spawn the recorder on a dedicated OS thread.
pub fn spawn_recorder(
    mut recorder: SessionRecorder,
    capacity: usize,
) -> Result<(RecorderHandle, RecorderThread), RecorderError> {
    let (tx, mut rx) = mpsc::channel::<RecorderRequest>(capacity.max(1));

    let join = std::thread::Builder::new()
        .name("rollcall-recorder".into())
        .spawn(move || {
            tracing::info!("recorder thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    RecorderRequest::Apply {
                        session,
                        candidates,
                        reply,
                    } => match recorder.apply(session, &candidates) {
                        Ok(events) => {
                            if let Some(reply) = reply {
                                let _ = reply.send(Ok(events));
                            }
                        }
                        Err(err) => {
                            if let Some(reply) = reply {
                                let _ = reply.send(Err(RecorderError::Stopped(err.to_string())));
                            }
                            tracing::error!(error = %err, "recorder stopping");
                            return Err(err);
                        }
                    },
                    RecorderRequest::Open { course, at, reply } => {
                        let _ = reply.send(recorder.open_session(&course, at));
                    }
                    RecorderRequest::Close { id, at, reply } => {
                        let _ = reply.send(recorder.close_session(id, at));
                    }
                    RecorderRequest::CloseStale { now, reply } => {
                        let _ = reply.send(recorder.close_stale(now));
                    }
                    RecorderRequest::Stop => break,
                }
            }
            let stats = recorder.stats();
            tracing::info!(?stats, "recorder thread exiting");
            Ok(stats)
        })?;

    Ok((RecorderHandle { tx }, RecorderThread { join }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerOptions;
    use crate::types::{FrameRef, MatchIdentity, StudentId};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 14, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn candidate(student: StudentId, seq: u64, secs: i64, confidence: f32) -> CandidateMatch {
        CandidateMatch {
            identity: MatchIdentity::Student(student),
            distance: 2.0 * (1.0 - confidence),
            confidence,
            frame: FrameRef {
                source: "cam".into(),
                sequence: seq,
                digest: format!("{seq:064x}"),
            },
            observed_at: t(secs),
        }
    }

    fn setup(options: LedgerOptions, config: DedupConfig) -> (SessionRecorder, Arc<Ledger>, StudentId, StudentId) {
        let ledger = Arc::new(Ledger::open_in_memory(options).unwrap());
        let a = ledger.register_student("A", t(0)).unwrap().id;
        let b = ledger.register_student("B", t(0)).unwrap().id;
        (SessionRecorder::new(ledger.clone(), config), ledger, a, b)
    }

    #[test]
    fn test_a_b_scenario() {
        let (mut rec, ledger, a, b) = setup(LedgerOptions::default(), DedupConfig::default());
        let session = rec.open_session("math", t(0)).unwrap();

        // A seen at t=0 and t=2 (different frames); B seen only once.
        assert!(rec.apply(session.id, &[candidate(a, 1, 0, 0.9), candidate(b, 1, 0, 0.8)]).unwrap().is_empty());
        let events = rec.apply(session.id, &[candidate(a, 2, 2, 0.7)]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].student_id, a);
        assert_eq!(events[0].timestamp, t(0));
        assert_eq!(events[0].confidence, 0.7);

        // A keeps showing up: no more events.
        assert!(rec.apply(session.id, &[candidate(a, 3, 4, 0.9)]).unwrap().is_empty());

        let stored = ledger.events_for_session(session.id).unwrap();
        assert_eq!(stored, events);
    }

    #[test]
    fn test_two_regions_one_frame_no_event() {
        let (mut rec, ledger, a, _) = setup(LedgerOptions::default(), DedupConfig::default());
        let session = rec.open_session("math", t(0)).unwrap();
        let events = rec.apply(session.id, &[candidate(a, 1, 0, 0.9), candidate(a, 1, 0, 0.9)]).unwrap();
        assert!(events.is_empty());
        assert!(ledger.events_for_session(session.id).unwrap().is_empty());
    }

    #[test]
    fn test_late_confirmation_after_close() {
        let (mut rec, ledger, a, _) = setup(LedgerOptions::default(), DedupConfig::default());
        let session = rec.open_session("math", t(0)).unwrap();
        rec.apply(session.id, &[candidate(a, 1, 0, 0.9)]).unwrap();
        ledger.close_session(session.id, t(1)).unwrap();

        let events = rec.apply(session.id, &[candidate(a, 2, 2, 0.9)]).unwrap();
        assert!(events.is_empty());
        assert_eq!(rec.stats().absorbed, 1);
        assert!(ledger.events_for_session(session.id).unwrap().is_empty());
    }

    #[test]
    fn test_close_forgets_presence_state() {
        let (mut rec, _ledger, a, _) = setup(LedgerOptions::default(), DedupConfig::default());
        let session = rec.open_session("math", t(0)).unwrap();
        rec.apply(session.id, &[candidate(a, 1, 0, 0.9)]).unwrap();
        assert_eq!(rec.deduplicator().pending_count(), 1);
        rec.close_session(session.id, t(10)).unwrap();
        assert_eq!(rec.deduplicator().pending_count(), 0);
    }

    #[test]
    fn test_reentry_recorded_with_next_entry() {
        let config = DedupConfig {
            reentry_gap: Some(Duration::minutes(10)),
            ..DedupConfig::default()
        };
        let (mut rec, ledger, a, _) = setup(LedgerOptions { allow_reentry: true }, config);
        let session = rec.open_session("lab", t(0)).unwrap();
        rec.apply(session.id, &[candidate(a, 1, 0, 0.9), candidate(a, 2, 1, 0.9)]).unwrap();
        rec.apply(session.id, &[candidate(a, 3, 1200, 0.9)]).unwrap();
        let events = rec.apply(session.id, &[candidate(a, 4, 1201, 0.8)]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entry, 1);
        assert_eq!(ledger.events_for_session(session.id).unwrap().len(), 2);
    }

    #[test]
    fn test_session_timeout_sweep() {
        let (rec, ledger, a, _) = setup(LedgerOptions::default(), DedupConfig::default());
        let mut rec = rec.with_session_timeout(Some(Duration::minutes(30)));
        let old = rec.open_session("morning", t(0)).unwrap();
        let current = rec.open_session("noon", t(3000)).unwrap();

        rec.apply(current.id, &[candidate(a, 1, 3600, 0.9)]).unwrap();
        assert_eq!(ledger.session(old.id).unwrap().unwrap().status, crate::types::SessionStatus::Closed);
        assert_eq!(ledger.session(current.id).unwrap().unwrap().status, crate::types::SessionStatus::Open);
    }

    #[test]
    fn test_unknown_candidates_counted() {
        let (mut rec, _ledger, _, _) = setup(LedgerOptions::default(), DedupConfig::default());
        let session = rec.open_session("math", t(0)).unwrap();
        let mut unknown = candidate(StudentId(0), 1, 0, 0.1);
        unknown.identity = MatchIdentity::Unknown;
        rec.apply(session.id, &[unknown]).unwrap();
        assert_eq!(rec.stats().ignored, 1);
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (rec, ledger, a, _) = setup(LedgerOptions::default(), DedupConfig::default());
        let (handle, thread) = spawn_recorder(rec, 8).unwrap();

        let session = handle.open_session("math", t(0)).await.unwrap();
        handle.apply(session.id, vec![candidate(a, 1, 0, 0.9)]).await.unwrap();
        let events = handle.apply(session.id, vec![candidate(a, 2, 1, 0.9)]).await.unwrap();
        assert_eq!(events.len(), 1);
        let closed = handle.close_session(session.id, t(60)).await.unwrap();
        assert!(closed.ended_at.is_some());
        assert!(handle.close_session(crate::types::SessionId::new(), t(60)).await.is_err());

        drop(handle);
        let stats = tokio::task::spawn_blocking(move || thread.join()).await.unwrap().unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(ledger.events_for_session(session.id).unwrap().len(), 1);
    }
}
