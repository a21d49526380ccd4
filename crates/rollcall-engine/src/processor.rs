//! Frame → candidate matches.
//!
//! Stateless apart from the shared gallery handle, so any number of workers
//! may run one processor concurrently.

use crate::gallery::{GalleryError, SharedGallery};
use crate::types::{CandidateMatch, Frame, MatchIdentity};
use rollcall_vision::{DetectError, FaceDetector, FaceEncoder};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("frame {reference} could not be decoded: {source}")]
    FrameDecode {
        reference: String,
        #[source]
        source: image::ImageError,
    },
    #[error("detection failed: {0}")]
    Detect(#[from] DetectError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
}

/// Candidates of one frame plus the regions that could not be encoded or
/// compared with the gallery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameResult {
    pub candidates: Vec<CandidateMatch>,
    pub skipped_regions: usize,
}

pub struct FrameProcessor {
    detector: Arc<dyn FaceDetector>,
    encoder: Arc<dyn FaceEncoder>,
    gallery: SharedGallery,
    max_distance: f32,
}

impl FrameProcessor {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        encoder: Arc<dyn FaceEncoder>,
        gallery: SharedGallery,
        max_distance: f32,
    ) -> Self {
        Self {
            detector,
            encoder,
            gallery,
            max_distance,
        }
    }

    pub fn max_distance(&self) -> f32 {
        self.max_distance
    }

    /// One candidate per detected region, in detector order. Regions are
    /// independent: the same student may appear more than once.
    pub fn process(&self, frame: &Frame) -> Result<FrameResult, ProcessError> {
        let reference = frame.reference();
        let image = image::load_from_memory(&frame.data)
            .map_err(|source| ProcessError::FrameDecode {
                reference: reference.to_string(),
                source,
            })?
            .to_rgb8();

        let faces = self.detector.detect(&image)?;
        if faces.is_empty() {
            tracing::trace!(frame = %reference, "no faces");
            return Ok(FrameResult::default());
        }

        let gallery = self.gallery.read().map_err(|_| GalleryError::Poisoned)?;
        let metric = gallery.metric();
        let mut result = FrameResult::default();

        for face in &faces {
            let embedding = match self.encoder.encode(&image, face) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(frame = %reference, error = %err, x = face.x, y = face.y, "region skipped");
                    result.skipped_regions += 1;
                    continue;
                }
            };

            let lookup = gallery.query(&embedding, self.max_distance).and_then(|hits| match hits.first() {
                Some(hit) => Ok((MatchIdentity::Student(hit.student_id), hit.distance)),
                None => {
                    let nearest = gallery.nearest(&embedding)?;
                    Ok((MatchIdentity::Unknown, nearest.map_or(f32::INFINITY, |h| h.distance)))
                }
            });
            let (identity, distance) = match lookup {
                Ok(found) => found,
                Err(err @ (GalleryError::GalleryCorrupt(_) | GalleryError::Poisoned)) => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(frame = %reference, error = %err, x = face.x, y = face.y, "region not comparable with gallery");
                    result.skipped_regions += 1;
                    continue;
                }
            };

            result.candidates.push(CandidateMatch {
                identity,
                distance,
                confidence: metric.confidence(distance),
                frame: reference.clone(),
                observed_at: frame.captured_at,
            });
        }

        tracing::debug!(
            frame = %reference,
            faces = faces.len(),
            candidates = result.candidates.len(),
            skipped = result.skipped_regions,
            "frame processed"
        );
        Ok(result)
    }
}
