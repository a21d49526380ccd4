//! rollcall-engine — attendance recognition and reconciliation.
//!
//! Frames are matched against the [`gallery`] by the [`processor`], turned
//! into confirmed presence by the [`dedup`] state machine inside the single
//! [`recorder`] thread, persisted by the [`ledger`] and read back through
//! [`report`]. The [`pipeline`] wires these together behind a bounded queue.

pub mod dedup;
pub mod enrollment;
pub mod gallery;
pub mod ledger;
pub mod pipeline;
pub mod processor;
pub mod recorder;
pub mod report;
pub mod types;

#[cfg(test)]
mod testing;

pub use dedup::{DedupConfig, Deduplicator, Observation, PresenceState};
pub use enrollment::{rebuild_gallery, EnrollError, Enroller, EnrollmentReport, Photo, PhotoRejection};
pub use gallery::{GalleryError, GalleryIndex, SharedGallery};
pub use ledger::{Ledger, LedgerError, LedgerOptions};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineStats};
pub use processor::{FrameProcessor, ProcessError};
pub use recorder::{spawn_recorder, RecorderError, RecorderHandle, SessionRecorder};
pub use report::{Granularity, Recipient, ReportAggregator, ReportError};
pub use types::{AttendanceEvent, CandidateMatch, DateRange, Frame, Session, SessionId, Student, StudentId};
