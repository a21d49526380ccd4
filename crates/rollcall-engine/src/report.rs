//! Read-only attendance views.
//!
//! Every query runs inside a single ledger read transaction, so a report
//! never mixes two states of the ledger. Output records are plain serde
//! structs; charting and PDF rendering happen elsewhere.

use crate::ledger::{
    all_students, events_for_session, events_for_student_in, fetch_student, session_in, sessions_between, Ledger,
    LedgerError,
};
use crate::types::{AttendanceEvent, DateRange, Session, SessionId, Student, StudentId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("unknown student {0}")]
    UnknownStudent(StudentId),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// One row of a student's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub session_id: SessionId,
    pub course: String,
    pub session_start: DateTime<Utc>,
    pub present: bool,
    /// Confirmation time when present, session start otherwise.
    pub timestamp: DateTime<Utc>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub student_id: StudentId,
    pub name: String,
    pub confirmed_at: DateTime<Utc>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    Monthly,
}

impl Granularity {
    fn bucket(self, at: DateTime<Utc>) -> String {
        match self {
            Granularity::Daily => at.format("%Y-%m-%d").to_string(),
            Granularity::Monthly => at.format("%Y-%m").to_string(),
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(Granularity::Daily),
            "monthly" | "month" => Ok(Granularity::Monthly),
            other => Err(format!("unknown granularity '{other}' (expected daily or monthly)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesPoint {
    /// `YYYY-MM-DD` or `YYYY-MM`, UTC.
    pub period: String,
    pub present: u32,
    pub absent: u32,
}

/// Who a printed summary is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Parent,
    Management,
}

impl std::str::FromStr for Recipient {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parent" => Ok(Recipient::Parent),
            "management" => Ok(Recipient::Management),
            other => Err(format!("unknown recipient '{other}' (expected parent or management)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentSummary {
    pub student: Student,
    pub recipient: Recipient,
    pub range: DateRange,
    pub sessions: u32,
    pub present: u32,
    pub absent: u32,
    /// Share of sessions attended, `0.0..=100.0`.
    pub percentage: f64,
    pub entries: Vec<HistoryEntry>,
}

pub struct ReportAggregator {
    ledger: Arc<Ledger>,
}

impl ReportAggregator {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Every session that started in `range` and that the student was
    /// expected in, oldest first, with whether the student attended it.
    pub fn student_history(&self, student: StudentId, range: DateRange) -> Result<Vec<HistoryEntry>, ReportError> {
        self.ledger
            .read(|tx| {
                let Some(record) = fetch_student(tx, student)? else {
                    return Ok(None);
                };
                let sessions = sessions_between(tx, range)?;
                let events = events_for_student_in(tx, student)?;
                Ok(Some(history(&record, &sessions, &events)))
            })?
            .ok_or(ReportError::UnknownStudent(student))
    }

    /// Students confirmed in the session, by ascending id.
    pub fn session_roster(&self, session: SessionId) -> Result<Vec<RosterEntry>, ReportError> {
        self.ledger
            .read(|tx| {
                if session_in(tx, session)?.is_none() {
                    return Ok(None);
                }
                let names: HashMap<StudentId, String> =
                    all_students(tx)?.into_iter().map(|s| (s.id, s.name)).collect();
                let mut first: BTreeMap<StudentId, AttendanceEvent> = BTreeMap::new();
                for event in events_for_session(tx, session)? {
                    first.entry(event.student_id).or_insert(event);
                }
                let roster = first
                    .into_values()
                    .map(|event| RosterEntry {
                        student_id: event.student_id,
                        name: names.get(&event.student_id).cloned().unwrap_or_default(),
                        confirmed_at: event.timestamp,
                        confidence: event.confidence,
                    })
                    .collect();
                Ok(Some(roster))
            })?
            .ok_or(ReportError::UnknownSession(session))
    }

    /// Present/absent counts per day or month, oldest period first.
    pub fn attendance_series(
        &self,
        student: StudentId,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<SeriesPoint>, ReportError> {
        let entries = self.student_history(student, range)?;
        let mut buckets: BTreeMap<String, (u32, u32)> = BTreeMap::new();
        for entry in &entries {
            let counts = buckets.entry(granularity.bucket(entry.session_start)).or_default();
            if entry.present {
                counts.0 += 1;
            } else {
                counts.1 += 1;
            }
        }
        Ok(buckets
            .into_iter()
            .map(|(period, (present, absent))| SeriesPoint { period, present, absent })
            .collect())
    }

    pub fn student_summary(
        &self,
        student: StudentId,
        range: DateRange,
        recipient: Recipient,
    ) -> Result<StudentSummary, ReportError> {
        let (record, entries) = self
            .ledger
            .read(|tx| {
                let Some(record) = fetch_student(tx, student)? else {
                    return Ok(None);
                };
                let sessions = sessions_between(tx, range)?;
                let events = events_for_student_in(tx, student)?;
                let entries = history(&record, &sessions, &events);
                Ok(Some((record, entries)))
            })?
            .ok_or(ReportError::UnknownStudent(student))?;

        let sessions = entries.len() as u32;
        let present = entries.iter().filter(|e| e.present).count() as u32;
        let percentage = if sessions == 0 {
            0.0
        } else {
            f64::from(present) * 100.0 / f64::from(sessions)
        };
        Ok(StudentSummary {
            student: record,
            recipient,
            range,
            sessions,
            present,
            absent: sessions - present,
            percentage,
            entries,
        })
    }

    /// Active students expected in the session who were never confirmed.
    /// Students registered after the session ended are not expected.
    pub fn session_absentees(&self, session: SessionId) -> Result<Vec<Student>, ReportError> {
        self.ledger
            .read(|tx| {
                let Some(record) = session_in(tx, session)? else {
                    return Ok(None);
                };
                let present: Vec<StudentId> = events_for_session(tx, session)?.iter().map(|e| e.student_id).collect();
                let absent = all_students(tx)?
                    .into_iter()
                    .filter(|s| !s.retired && is_expected(s, &record) && !present.contains(&s.id))
                    .collect();
                Ok(Some(absent))
            })?
            .ok_or(ReportError::UnknownSession(session))
    }
}

fn is_expected(student: &Student, session: &Session) -> bool {
    session.ended_at.map_or(true, |end| student.registered_at <= end)
}

fn history(student: &Student, sessions: &[Session], events: &[AttendanceEvent]) -> Vec<HistoryEntry> {
    // Events arrive ordered by timestamp, so the first per session is the earliest.
    let mut first: HashMap<SessionId, &AttendanceEvent> = HashMap::new();
    for event in events {
        first.entry(event.session_id).or_insert(event);
    }
    sessions
        .iter()
        .filter(|session| is_expected(student, session))
        .map(|session| {
            let event = first.get(&session.id);
            HistoryEntry {
                session_id: session.id,
                course: session.course.clone(),
                session_start: session.started_at,
                present: event.is_some(),
                timestamp: event.map_or(session.started_at, |e| e.timestamp),
                confidence: event.map(|e| e.confidence),
            }
        })
        .collect()
}
