//! Per-(session, student) presence state machine.
//!
//! ```text
//! Unseen ──qualifying sighting──▶ Pending ──2nd sighting, other frame, within window──▶ Confirmed
//!    ▲                               │
//!    └────── window elapses ─────────┘
//! ```
//!
//! `Confirmed` is terminal for the session: repeats are absorbed. With
//! re-entry tracking, a sighting after an absence of at least the configured
//! gap opens a second corroboration cycle that yields the next entry.
//!
//! All timing uses frame timestamps, never the wall clock, so replays and
//! tests are deterministic. Corroboration is symmetric in time: a late
//! frame that predates the pending sighting still counts, and the event
//! carries the earliest of the two observations.

use crate::types::{AttendanceEvent, CandidateMatch, FrameRef, SessionId, StudentId};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupConfig {
    /// Minimum candidate confidence that may advance the state machine.
    pub confirm_threshold: f32,
    /// Maximum frame-time distance between two corroborating sightings.
    pub stability_window: Duration,
    /// Absence that counts as leaving the room; `None` disables re-entry tracking.
    pub reentry_gap: Option<Duration>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            confirm_threshold: 0.45,
            stability_window: Duration::seconds(5),
            reentry_gap: None,
        }
    }
}

/// Composite key of the presence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PresenceKey {
    pub session: SessionId,
    pub student: StudentId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub at: DateTime<Utc>,
    pub confidence: f32,
    pub frame: FrameRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceState {
    Unseen,
    Pending {
        first: Sighting,
    },
    Confirmed {
        confirmed_at: DateTime<Utc>,
        last_seen: DateTime<Utc>,
        /// Events written so far for this key.
        entries: u32,
        /// Uncorroborated sighting after an absence (re-entry tracking only).
        returning: Option<Sighting>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Unknown,
    BelowThreshold,
}

/// Outcome of feeding one candidate to the deduplicator.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Ignored(IgnoreReason),
    /// Waiting for corroboration.
    Pending,
    /// A new attendance event must be written.
    Confirmed(AttendanceEvent),
    /// Already confirmed; nothing to record.
    Repeat,
}

#[derive(Debug, Default)]
pub struct Deduplicator {
    config: DedupConfig,
    states: BTreeMap<PresenceKey, PresenceState>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn state(&self, session: SessionId, student: StudentId) -> PresenceState {
        self.states
            .get(&PresenceKey { session, student })
            .cloned()
            .unwrap_or(PresenceState::Unseen)
    }

    pub fn pending_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, PresenceState::Pending { .. }))
            .count()
    }

    fn within_window(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        let gap = if a > b { a - b } else { b - a };
        gap <= self.config.stability_window
    }

    pub fn observe(&mut self, session: SessionId, candidate: &CandidateMatch) -> Observation {
        let Some(student) = candidate.student() else {
            return Observation::Ignored(IgnoreReason::Unknown);
        };
        if candidate.confidence < self.config.confirm_threshold {
            tracing::debug!(%session, %student, confidence = candidate.confidence, "candidate below threshold");
            return Observation::Ignored(IgnoreReason::BelowThreshold);
        }

        let key = PresenceKey { session, student };
        let sighting = Sighting {
            at: candidate.observed_at,
            confidence: candidate.confidence,
            frame: candidate.frame.clone(),
        };
        let previous = self.states.remove(&key).unwrap_or(PresenceState::Unseen);
        let (next, observation) = self.step(key, previous, sighting);
        self.states.insert(key, next);

        if let Observation::Confirmed(event) = &observation {
            tracing::info!(
                %session,
                %student,
                entry = event.entry,
                at = %event.timestamp,
                confidence = event.confidence,
                "attendance confirmed"
            );
        }
        observation
    }

    fn step(&self, key: PresenceKey, state: PresenceState, s: Sighting) -> (PresenceState, Observation) {
        match state {
            PresenceState::Unseen => (PresenceState::Pending { first: s }, Observation::Pending),

            PresenceState::Pending { first } => {
                if first.frame == s.frame {
                    // Several regions of one frame are not independent evidence.
                    (PresenceState::Pending { first }, Observation::Pending)
                } else if self.within_window(first.at, s.at) {
                    let last_seen = first.at.max(s.at);
                    let event = corroborated(key, 0, first, s);
                    let state = PresenceState::Confirmed {
                        confirmed_at: event.timestamp,
                        last_seen,
                        entries: 1,
                        returning: None,
                    };
                    (state, Observation::Confirmed(event))
                } else if s.at > first.at {
                    tracing::debug!(session = %key.session, student = %key.student, "pending sighting expired; restarting");
                    (PresenceState::Pending { first: s }, Observation::Pending)
                } else {
                    // Stale frame from before the window; keep the newer sighting.
                    (PresenceState::Pending { first }, Observation::Pending)
                }
            }

            PresenceState::Confirmed {
                confirmed_at,
                last_seen,
                entries,
                returning,
            } => {
                let Some(gap) = self.config.reentry_gap else {
                    let state = PresenceState::Confirmed {
                        confirmed_at,
                        last_seen: last_seen.max(s.at),
                        entries,
                        returning,
                    };
                    return (state, Observation::Repeat);
                };

                if s.at - last_seen < gap {
                    let state = PresenceState::Confirmed {
                        confirmed_at,
                        last_seen: last_seen.max(s.at),
                        entries,
                        returning: None,
                    };
                    return (state, Observation::Repeat);
                }

                match returning {
                    Some(r) if r.frame != s.frame && self.within_window(r.at, s.at) => {
                        let seen = r.at.max(s.at);
                        let event = corroborated(key, entries, r, s);
                        let state = PresenceState::Confirmed {
                            confirmed_at,
                            last_seen: seen,
                            entries: entries + 1,
                            returning: None,
                        };
                        (state, Observation::Confirmed(event))
                    }
                    Some(r) if r.frame == s.frame || s.at < r.at => {
                        let state = PresenceState::Confirmed {
                            confirmed_at,
                            last_seen,
                            entries,
                            returning: Some(r),
                        };
                        (state, Observation::Pending)
                    }
                    _ => {
                        let state = PresenceState::Confirmed {
                            confirmed_at,
                            last_seen,
                            entries,
                            returning: Some(s),
                        };
                        (state, Observation::Pending)
                    }
                }
            }
        }
    }

    /// Drop pending sightings whose window closed before `now`.
    /// Returns how many pending states fell back to `Unseen`.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let window = self.config.stability_window;
        let before = self.states.len();
        self.states.retain(|_, state| match state {
            PresenceState::Pending { first } => now - first.at <= window,
            _ => true,
        });
        for state in self.states.values_mut() {
            if let PresenceState::Confirmed { returning, .. } = state {
                if returning.as_ref().is_some_and(|r| now - r.at > window) {
                    *returning = None;
                }
            }
        }
        let expired = before - self.states.len();
        if expired > 0 {
            tracing::debug!(expired, %now, "pending sightings expired");
        }
        expired
    }

    /// Discard all state of a session (after it closes).
    pub fn forget_session(&mut self, session: SessionId) -> usize {
        let before = self.states.len();
        self.states.retain(|key, _| key.session != session);
        before - self.states.len()
    }
}

/// Event for two corroborating sightings: earliest timestamp and frame,
/// and the weaker of the two confidences.
fn corroborated(key: PresenceKey, entry: u32, a: Sighting, b: Sighting) -> AttendanceEvent {
    let confidence = a.confidence.min(b.confidence);
    let earliest = if b.at < a.at { b } else { a };
    AttendanceEvent {
        session_id: key.session,
        student_id: key.student,
        entry,
        timestamp: earliest.at,
        confidence,
        source_frame: Some(earliest.frame.to_string()),
    }
}
