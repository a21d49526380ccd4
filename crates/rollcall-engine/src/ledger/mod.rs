//! Durable attendance ledger on SQLite.
//!
//! Sessions and attendance events are append-mostly: events are never
//! updated or deleted, sessions only move from open to closed. Every write
//! runs in its own transaction; there are no cross-event transactions.
//! Timestamps are stored as Unix milliseconds so range queries compare
//! numerically.

mod migrations;
mod students;

pub use migrations::MigrationError;
pub(crate) use students::{all_students, fetch_student};

use crate::types::{AttendanceEvent, DateRange, Session, SessionId, SessionStatus, StudentId};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance already recorded for student {student} in session {session} (entry {entry})")]
    DuplicateEvent {
        session: SessionId,
        student: StudentId,
        entry: u32,
    },
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("unknown student {0}")]
    UnknownStudent(StudentId),
    #[error("student {0} is retired")]
    StudentRetired(StudentId),
    #[error("corrupt ledger row: {0}")]
    CorruptRow(String),
    #[error("schema: {0}")]
    Migration(#[from] MigrationError),
    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("ledger directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger connection lock poisoned")]
    Poisoned,
}

impl LedgerError {
    /// Expected races on the write path that callers treat as no-ops.
    pub fn is_benign(&self) -> bool {
        matches!(self, LedgerError::DuplicateEvent { .. } | LedgerError::SessionClosed(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerOptions {
    /// Accept events with `entry > 0` (re-entry tracking).
    pub allow_reentry: bool,
}

pub struct Ledger {
    conn: Mutex<Connection>,
    options: LedgerOptions,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| LedgerError::CorruptRow(format!("timestamp {ms} out of range")))
}

fn parse_session_id(raw: &str) -> Result<SessionId, LedgerError> {
    raw.parse()
        .map_err(|_| LedgerError::CorruptRow(format!("invalid session id '{raw}'")))
}

type SessionRow = (String, String, i64, Option<i64>, String);

const SESSION_COLUMNS: &str = "id, course, started_at, ended_at, status";

fn session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn session_from_row((id, course, started_at, ended_at, status): SessionRow) -> Result<Session, LedgerError> {
    Ok(Session {
        id: parse_session_id(&id)?,
        course,
        started_at: from_millis(started_at)?,
        ended_at: ended_at.map(from_millis).transpose()?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| LedgerError::CorruptRow(format!("unknown session status '{status}'")))?,
    })
}

type EventRow = (String, i64, i64, i64, f64, Option<String>);

const EVENT_COLUMNS: &str = "session_id, student_id, entry, timestamp, confidence, source_frame";

fn event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn event_from_row((session, student, entry, ts, confidence, source_frame): EventRow) -> Result<AttendanceEvent, LedgerError> {
    Ok(AttendanceEvent {
        session_id: parse_session_id(&session)?,
        student_id: StudentId(student),
        entry: u32::try_from(entry).map_err(|_| LedgerError::CorruptRow(format!("negative entry {entry}")))?,
        timestamp: from_millis(ts)?,
        confidence: confidence as f32,
        source_frame,
    })
}

fn fetch_session(conn: &Connection, id: SessionId) -> Result<Option<Session>, LedgerError> {
    let row = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id.to_string()],
            session_row,
        )
        .optional()?;
    row.map(session_from_row).transpose()
}

impl Ledger {
    pub fn open(path: &Path, options: LedgerOptions) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::warn!(error = %err, "failed to enable WAL mode");
        }
        let ledger = Self::init(conn, options)?;
        tracing::info!(path = %path.display(), ?options, "ledger opened");
        Ok(ledger)
    }

    pub fn open_in_memory(options: LedgerOptions) -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?, options)
    }

    fn init(mut conn: Connection, options: LedgerOptions) -> Result<Self, LedgerError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    pub fn options(&self) -> LedgerOptions {
        self.options
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Run read queries against one consistent snapshot.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // --- sessions ---

    pub fn open_session(&self, course: &str, started_at: DateTime<Utc>) -> Result<Session, LedgerError> {
        let session = Session {
            id: SessionId::new(),
            course: course.to_string(),
            started_at,
            ended_at: None,
            status: SessionStatus::Open,
        };
        self.write(|tx| {
            tx.execute(
                "INSERT INTO sessions (id, course, started_at, ended_at, status) VALUES (?1, ?2, ?3, NULL, ?4)",
                params![
                    session.id.to_string(),
                    session.course,
                    to_millis(started_at),
                    SessionStatus::Open.as_str()
                ],
            )?;
            Ok(())
        })?;
        tracing::info!(session = %session.id, course, "session opened");
        Ok(session)
    }

    /// Close a session. Closing an already closed session returns it unchanged.
    pub fn close_session(&self, id: SessionId, ended_at: DateTime<Utc>) -> Result<Session, LedgerError> {
        let session = self.write(|tx| {
            let mut session = fetch_session(tx, id)?.ok_or(LedgerError::UnknownSession(id))?;
            if session.status == SessionStatus::Closed {
                return Ok(session);
            }
            tx.execute(
                "UPDATE sessions SET status = ?1, ended_at = ?2 WHERE id = ?3",
                params![SessionStatus::Closed.as_str(), to_millis(ended_at), id.to_string()],
            )?;
            session.status = SessionStatus::Closed;
            session.ended_at = Some(ended_at);
            Ok(session)
        })?;
        tracing::info!(session = %id, "session closed");
        Ok(session)
    }

    /// Close every open session started before `started_before` (monitoring
    /// timeout). Returns the ids that were closed.
    pub fn close_stale_sessions(
        &self,
        started_before: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Vec<SessionId>, LedgerError> {
        let closed = self.write(|tx| {
            let ids: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM sessions WHERE status = 'open' AND started_at < ?1")?;
                let rows = stmt.query_map(params![to_millis(started_before)], |row| row.get(0))?;
                let ids = rows.collect::<Result<Vec<String>, _>>()?;
                ids
            };
            for id in &ids {
                tx.execute(
                    "UPDATE sessions SET status = 'closed', ended_at = ?1 WHERE id = ?2",
                    params![to_millis(ended_at), id],
                )?;
            }
            ids.iter().map(|id| parse_session_id(id)).collect::<Result<Vec<_>, _>>()
        })?;
        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "stale sessions closed");
        }
        Ok(closed)
    }

    pub fn session(&self, id: SessionId) -> Result<Option<Session>, LedgerError> {
        self.read(|tx| fetch_session(tx, id))
    }

    pub fn open_sessions(&self) -> Result<Vec<Session>, LedgerError> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'open' ORDER BY started_at, id"
            ))?;
            let rows = stmt.query_map([], session_row)?.collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(session_from_row).collect()
        })
    }

    /// Sessions that started inside `range`, oldest first.
    pub fn sessions_between(&self, range: DateRange) -> Result<Vec<Session>, LedgerError> {
        self.read(|tx| sessions_between(tx, range))
    }

    // --- events ---

    /// Append one attendance event.
    pub fn record(&self, event: &AttendanceEvent) -> Result<(), LedgerError> {
        if event.entry > 0 && !self.options.allow_reentry {
            return Err(LedgerError::DuplicateEvent {
                session: event.session_id,
                student: event.student_id,
                entry: event.entry,
            });
        }

        self.write(|tx| {
            let session = fetch_session(tx, event.session_id)?.ok_or(LedgerError::UnknownSession(event.session_id))?;
            if session.status == SessionStatus::Closed {
                return Err(LedgerError::SessionClosed(event.session_id));
            }
            let student_known: Option<i64> = tx
                .query_row("SELECT 1 FROM students WHERE id = ?1", params![event.student_id.0], |row| row.get(0))
                .optional()?;
            if student_known.is_none() {
                return Err(LedgerError::UnknownStudent(event.student_id));
            }
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM attendance_events WHERE session_id = ?1 AND student_id = ?2 AND entry = ?3",
                    params![event.session_id.to_string(), event.student_id.0, event.entry],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(LedgerError::DuplicateEvent {
                    session: event.session_id,
                    student: event.student_id,
                    entry: event.entry,
                });
            }

            tx.execute(
                &format!("INSERT INTO attendance_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    event.session_id.to_string(),
                    event.student_id.0,
                    event.entry,
                    to_millis(event.timestamp),
                    event.confidence as f64,
                    event.source_frame,
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(session = %event.session_id, student = %event.student_id, entry = event.entry, "event recorded");
        Ok(())
    }

    pub fn events_for_session(&self, id: SessionId) -> Result<Vec<AttendanceEvent>, LedgerError> {
        self.read(|tx| events_for_session(tx, id))
    }

    pub fn events_for_student(&self, student: StudentId, range: DateRange) -> Result<Vec<AttendanceEvent>, LedgerError> {
        self.read(|tx| {
            query_events(
                tx,
                "WHERE student_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
                params![student.0, to_millis(range.start), to_millis(range.end)],
            )
        })
    }

    pub fn events_between(&self, range: DateRange) -> Result<Vec<AttendanceEvent>, LedgerError> {
        self.read(|tx| {
            query_events(
                tx,
                "WHERE timestamp >= ?1 AND timestamp < ?2",
                params![to_millis(range.start), to_millis(range.end)],
            )
        })
    }
}

pub(crate) fn sessions_between(conn: &Connection, range: DateRange) -> Result<Vec<Session>, LedgerError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE started_at >= ?1 AND started_at < ?2 ORDER BY started_at, id"
    ))?;
    let rows = stmt
        .query_map(params![to_millis(range.start), to_millis(range.end)], session_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(session_from_row).collect()
}

pub(crate) fn session_in(conn: &Connection, id: SessionId) -> Result<Option<Session>, LedgerError> {
    fetch_session(conn, id)
}

pub(crate) fn events_for_session(conn: &Connection, id: SessionId) -> Result<Vec<AttendanceEvent>, LedgerError> {
    query_events(conn, "WHERE session_id = ?1", params![id.to_string()])
}

pub(crate) fn events_for_student_in(
    conn: &Connection,
    student: StudentId,
) -> Result<Vec<AttendanceEvent>, LedgerError> {
    query_events(conn, "WHERE student_id = ?1", params![student.0])
}

fn query_events(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<AttendanceEvent>, LedgerError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM attendance_events {filter} ORDER BY timestamp, student_id, entry"
    ))?;
    let rows = stmt.query_map(params, event_row)?.collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(event_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 14, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn ledger() -> Ledger {
        Ledger::open_in_memory(LedgerOptions::default()).unwrap()
    }

    fn event(session: SessionId, student: StudentId, secs: i64) -> AttendanceEvent {
        AttendanceEvent {
            session_id: session,
            student_id: student,
            entry: 0,
            timestamp: t(secs),
            confidence: 0.8,
            source_frame: Some("cam#1@abc".into()),
        }
    }

    #[test]
    fn test_record_and_read_back() {
        let ledger = ledger();
        let alice = ledger.register_student("Alice", t(0)).unwrap();
        let session = ledger.open_session("math", t(0)).unwrap();
        let e = event(session.id, alice.id, 5);
        ledger.record(&e).unwrap();

        assert_eq!(ledger.events_for_session(session.id).unwrap(), vec![e.clone()]);
        assert_eq!(ledger.events_for_student(alice.id, DateRange::all()).unwrap(), vec![e]);
        assert!(ledger
            .events_between(DateRange::new(t(6), t(100)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_duplicate_event_rejected() {
        let ledger = ledger();
        let alice = ledger.register_student("Alice", t(0)).unwrap();
        let session = ledger.open_session("math", t(0)).unwrap();
        ledger.record(&event(session.id, alice.id, 5)).unwrap();
        let err = ledger.record(&event(session.id, alice.id, 9)).unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateEvent { .. }));
        assert!(err.is_benign());
        assert_eq!(ledger.events_for_session(session.id).unwrap().len(), 1);
    }

    #[test]
    fn test_reentry_requires_option() {
        let strict = ledger();
        let alice = strict.register_student("Alice", t(0)).unwrap();
        let session = strict.open_session("math", t(0)).unwrap();
        let mut second = event(session.id, alice.id, 500);
        second.entry = 1;
        assert!(matches!(strict.record(&second), Err(LedgerError::DuplicateEvent { entry: 1, .. })));

        let relaxed = Ledger::open_in_memory(LedgerOptions { allow_reentry: true }).unwrap();
        let alice = relaxed.register_student("Alice", t(0)).unwrap();
        let session = relaxed.open_session("math", t(0)).unwrap();
        relaxed.record(&event(session.id, alice.id, 5)).unwrap();
        second.session_id = session.id;
        second.student_id = alice.id;
        relaxed.record(&second).unwrap();
        assert_eq!(relaxed.events_for_session(session.id).unwrap().len(), 2);
    }

    #[test]
    fn test_closed_session_rejects_late_event() {
        let ledger = ledger();
        let alice = ledger.register_student("Alice", t(0)).unwrap();
        let session = ledger.open_session("math", t(0)).unwrap();
        let closed = ledger.close_session(session.id, t(3600)).unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.ended_at, Some(t(3600)));

        let err = ledger.record(&event(session.id, alice.id, 10)).unwrap_err();
        assert!(matches!(err, LedgerError::SessionClosed(id) if id == session.id));
        assert!(ledger.events_for_session(session.id).unwrap().is_empty());

        // Closing again is a no-op.
        assert_eq!(ledger.close_session(session.id, t(7200)).unwrap().ended_at, Some(t(3600)));
    }

    #[test]
    fn test_unknown_session_and_student() {
        let ledger = ledger();
        let alice = ledger.register_student("Alice", t(0)).unwrap();
        let ghost = SessionId::new();
        assert!(matches!(
            ledger.record(&event(ghost, alice.id, 0)),
            Err(LedgerError::UnknownSession(_))
        ));
        let session = ledger.open_session("math", t(0)).unwrap();
        assert!(matches!(
            ledger.record(&event(session.id, StudentId(99), 0)),
            Err(LedgerError::UnknownStudent(StudentId(99)))
        ));
        assert!(matches!(ledger.close_session(ghost, t(1)), Err(LedgerError::UnknownSession(_))));
    }

    #[test]
    fn test_stale_sessions_closed() {
        let ledger = ledger();
        let old = ledger.open_session("history", t(0)).unwrap();
        let fresh = ledger.open_session("physics", t(7000)).unwrap();
        let closed = ledger.close_stale_sessions(t(3600), t(7200)).unwrap();
        assert_eq!(closed, vec![old.id]);
        let open: Vec<_> = ledger.open_sessions().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(open, vec![fresh.id]);
    }

    #[test]
    fn test_sessions_between_ordered() {
        let ledger = ledger();
        let b = ledger.open_session("b", t(100)).unwrap();
        let a = ledger.open_session("a", t(10)).unwrap();
        ledger.open_session("late", t(10_000)).unwrap();
        let ids: Vec<_> = ledger
            .sessions_between(DateRange::new(t(0), t(1000)))
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn test_reopen_file_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let session_id = {
            let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();
            let alice = ledger.register_student("Alice", t(0)).unwrap();
            let session = ledger.open_session("math", t(0)).unwrap();
            ledger.record(&event(session.id, alice.id, 1)).unwrap();
            session.id
        };
        let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();
        assert_eq!(ledger.events_for_session(session_id).unwrap().len(), 1);
    }
}
