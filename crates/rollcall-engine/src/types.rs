use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Ledger-assigned student identifier. Lower ids win distance ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(pub i64);

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

/// A registered student as listed by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    pub registered_at: DateTime<Utc>,
    pub retired: bool,
    /// Number of reference embeddings on file.
    pub embeddings: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(SessionStatus::Open),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

/// One monitored class period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub course: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// The atomic fact of record: a student was confirmed present in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub session_id: SessionId,
    pub student_id: StudentId,
    /// 0 for the first arrival; re-entries (when tracked) count up from 1.
    pub entry: u32,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub source_frame: Option<String>,
}

/// An encoded camera frame pushed in by the frame source.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Camera or feed name.
    pub source: String,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    /// Encoded image bytes (JPEG, PNG, ...).
    pub data: Vec<u8>,
}

impl Frame {
    pub fn reference(&self) -> FrameRef {
        FrameRef {
            source: self.source.clone(),
            sequence: self.sequence,
            digest: format!("{:x}", Sha256::digest(&self.data)),
        }
    }
}

/// Audit reference to the frame a candidate came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRef {
    pub source: String,
    pub sequence: u64,
    /// Hex SHA-256 of the encoded frame bytes.
    pub digest: String,
}

impl fmt::Display for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.digest.get(..16).unwrap_or(&self.digest);
        write!(f, "{}#{}@{}", self.source, self.sequence, short)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchIdentity {
    Student(StudentId),
    Unknown,
}

/// Transient per-region match produced by the frame processor.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMatch {
    pub identity: MatchIdentity,
    /// Distance to the closest gallery entry (or to the nearest rejected one
    /// for unknown faces; `f32::INFINITY` with an empty gallery).
    pub distance: f32,
    /// `[0, 1]`, higher is more certain.
    pub confidence: f32,
    pub frame: FrameRef,
    pub observed_at: DateTime<Utc>,
}

impl CandidateMatch {
    pub fn student(&self) -> Option<StudentId> {
        match self.identity {
            MatchIdentity::Student(id) => Some(id),
            MatchIdentity::Unknown => None,
        }
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Everything representable; used when a caller gives no bounds.
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}
