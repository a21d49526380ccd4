//! Enrollment: reference photos in, stored embeddings out.
//!
//! Each photo must hold exactly one face. Rejected photos are reported back
//! with the reason instead of silently dropped. Embeddings the gallery
//! would refuse are rejected before anything is written; accepted ones are
//! persisted to the ledger first and then added to the live gallery.

use crate::gallery::{GalleryError, GalleryIndex, SharedGallery};
use crate::ledger::{Ledger, LedgerError};
use crate::types::{Student, StudentId};
use chrono::Utc;
use rollcall_vision::{encode_single_face, Embedding, EncodeError, FaceDetector, FaceEncoder};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("none of the {0} photos could be used")]
    NoUsablePhoto(usize, Vec<PhotoRejection>),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
}

/// An enrollment photo as received from the operator.
#[derive(Debug, Clone)]
pub struct Photo {
    /// File name or other label used in rejection reports.
    pub label: String,
    /// Encoded image bytes.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Unreadable,
    NoFace,
    MultipleFaces,
    EncodeFailed,
    /// The embedding does not fit the gallery (dimension, model or values).
    Incompatible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhotoRejection {
    pub label: String,
    pub reason: RejectReason,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentReport {
    pub student: Student,
    pub accepted: usize,
    /// Photos whose embedding the student already had.
    pub duplicates: usize,
    pub rejected: Vec<PhotoRejection>,
}

pub struct Enroller {
    detector: Arc<dyn FaceDetector>,
    encoder: Arc<dyn FaceEncoder>,
    ledger: Arc<Ledger>,
    gallery: SharedGallery,
}

impl Enroller {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        encoder: Arc<dyn FaceEncoder>,
        ledger: Arc<Ledger>,
        gallery: SharedGallery,
    ) -> Self {
        Self {
            detector,
            encoder,
            ledger,
            gallery,
        }
    }

    /// Register a new student from their photos. Nothing is stored when
    /// every photo is rejected.
    pub fn enroll(&self, name: &str, photos: &[Photo]) -> Result<EnrollmentReport, EnrollError> {
        self.check_model()?;
        let (embeddings, mut rejected) = self.encode_all(photos);
        let mut gallery = self.gallery.write().map_err(|_| GalleryError::Poisoned)?;
        let embeddings = admit(&gallery, embeddings, &mut rejected);
        if embeddings.is_empty() {
            return Err(EnrollError::NoUsablePhoto(photos.len(), rejected));
        }
        let student = self.ledger.register_student(name, Utc::now())?;
        self.store(&mut gallery, student.id, embeddings, rejected)
    }

    /// Add reference photos to an existing student.
    pub fn add_photos(&self, student: StudentId, photos: &[Photo]) -> Result<EnrollmentReport, EnrollError> {
        self.check_model()?;
        let (embeddings, mut rejected) = self.encode_all(photos);
        let mut gallery = self.gallery.write().map_err(|_| GalleryError::Poisoned)?;
        let embeddings = admit(&gallery, embeddings, &mut rejected);
        self.store(&mut gallery, student, embeddings, rejected)
    }

    /// Retire a student and drop them from live matching.
    pub fn retire(&self, student: StudentId) -> Result<(), EnrollError> {
        self.ledger.retire_student(student)?;
        let removed = self
            .gallery
            .write()
            .map_err(|_| GalleryError::Poisoned)?
            .remove_student(student);
        tracing::info!(%student, removed, "student removed from gallery");
        Ok(())
    }

    fn check_model(&self) -> Result<(), GalleryError> {
        let gallery = self.gallery.read().map_err(|_| GalleryError::Poisoned)?;
        if gallery.model_version() != self.encoder.model_version() {
            return Err(GalleryError::ModelVersionMismatch {
                expected: gallery.model_version().to_string(),
                found: self.encoder.model_version().to_string(),
            });
        }
        Ok(())
    }

    fn encode_all(&self, photos: &[Photo]) -> (Vec<(String, Embedding)>, Vec<PhotoRejection>) {
        let mut embeddings = Vec::new();
        let mut rejected = Vec::new();
        for photo in photos {
            match self.encode_photo(photo) {
                Ok(embedding) => embeddings.push((photo.label.clone(), embedding)),
                Err(rejection) => {
                    tracing::warn!(photo = %rejection.label, reason = ?rejection.reason, detail = %rejection.detail, "enrollment photo rejected");
                    rejected.push(rejection);
                }
            }
        }
        (embeddings, rejected)
    }

    fn encode_photo(&self, photo: &Photo) -> Result<Embedding, PhotoRejection> {
        let reject = |reason: RejectReason, detail: String| PhotoRejection {
            label: photo.label.clone(),
            reason,
            detail,
        };
        let image = image::load_from_memory(&photo.data)
            .map_err(|e| reject(RejectReason::Unreadable, e.to_string()))?
            .to_rgb8();
        encode_single_face(self.detector.as_ref(), self.encoder.as_ref(), &image).map_err(|e| {
            let reason = match e {
                EncodeError::NoFaceDetected => RejectReason::NoFace,
                EncodeError::MultipleFacesInRegion(_) => RejectReason::MultipleFaces,
                _ => RejectReason::EncodeFailed,
            };
            reject(reason, e.to_string())
        })
    }

    /// Persist admitted embeddings and mirror them into the gallery. The
    /// caller holds the gallery write lock throughout.
    fn store(
        &self,
        gallery: &mut GalleryIndex,
        student: StudentId,
        embeddings: Vec<Embedding>,
        rejected: Vec<PhotoRejection>,
    ) -> Result<EnrollmentReport, EnrollError> {
        let mut accepted = 0;
        let mut duplicates = 0;
        for embedding in embeddings {
            if !self.ledger.append_embedding(student, &embedding)? {
                duplicates += 1;
                continue;
            }
            gallery.add(student, embedding)?;
            accepted += 1;
        }

        let student = self.ledger.student(student)?.ok_or(LedgerError::UnknownStudent(student))?;
        tracing::info!(student = %student.id, accepted, duplicates, rejected = rejected.len(), "enrollment stored");
        Ok(EnrollmentReport {
            student,
            accepted,
            duplicates,
            rejected,
        })
    }
}

/// Keep the embeddings the gallery would accept, including against each
/// other, and reject the rest.
fn admit(
    gallery: &GalleryIndex,
    embeddings: Vec<(String, Embedding)>,
    rejected: &mut Vec<PhotoRejection>,
) -> Vec<Embedding> {
    let mut dim = gallery.dim();
    let mut admitted = Vec::new();
    for (label, embedding) in embeddings {
        match gallery.check(&embedding, dim) {
            Ok(()) => {
                dim = Some(embedding.dim());
                admitted.push(embedding);
            }
            Err(err) => {
                tracing::warn!(photo = %label, error = %err, "enrollment photo rejected");
                rejected.push(PhotoRejection {
                    label,
                    reason: RejectReason::Incompatible,
                    detail: err.to_string(),
                });
            }
        }
    }
    admitted
}

/// Reload the gallery from the ledger's student table.
///
/// An unreadable stored embedding marks the gallery corrupt just like a
/// malformed one would.
pub fn rebuild_gallery(ledger: &Ledger, gallery: &SharedGallery) -> Result<usize, EnrollError> {
    let enrollments = ledger.enrollments();
    let mut index = gallery.write().map_err(|_| GalleryError::Poisoned)?;
    match enrollments {
        Ok(enrollments) => Ok(index.rebuild(enrollments)?),
        Err(LedgerError::CorruptRow(reason)) => {
            index.mark_corrupt(reason.clone());
            Err(GalleryError::GalleryCorrupt(reason).into())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryIndex;
    use crate::ledger::LedgerOptions;
    use crate::testing::{
        colour_embedding, png, ColourEncoder, PixelDetector, ShortBlueEncoder, BLUE, GREEN, MODEL, RED, WHITE,
    };
    use rollcall_vision::Metric;

    fn enroller() -> (Enroller, Arc<Ledger>, SharedGallery) {
        let ledger = Arc::new(Ledger::open_in_memory(LedgerOptions::default()).unwrap());
        let gallery = GalleryIndex::new(MODEL, Metric::Euclidean).shared();
        let enroller = Enroller::new(Arc::new(PixelDetector), Arc::new(ColourEncoder), ledger.clone(), gallery.clone());
        (enroller, ledger, gallery)
    }

    fn photo(label: &str, pixels: &[[u8; 3]]) -> Photo {
        Photo {
            label: label.into(),
            data: png(pixels),
        }
    }

    #[test]
    fn test_enrolled_photo_is_top_match() {
        let (enroller, _ledger, gallery) = enroller();
        let report = enroller.enroll("Ada", &[photo("ada.png", &[RED])]).unwrap();
        assert_eq!(report.accepted, 1);
        assert!(report.rejected.is_empty());

        let hits = gallery.read().unwrap().query(&colour_embedding(RED), 0.0).unwrap();
        assert_eq!(hits[0].student_id, report.student.id);
    }

    #[test]
    fn test_rejections_reported_per_photo() {
        let (enroller, _ledger, _gallery) = enroller();
        let photos = [
            photo("good.png", &[GREEN]),
            photo("empty.png", &[[0, 0, 0]]),
            photo("group.png", &[RED, BLUE]),
            photo("glare.png", &[WHITE]),
            Photo { label: "junk.bin".into(), data: vec![1, 2, 3] },
        ];
        let report = enroller.enroll("Ben", &photos).unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.student.embeddings, 1);
        let reasons: Vec<_> = report.rejected.iter().map(|r| (r.label.as_str(), r.reason.clone())).collect();
        assert_eq!(
            reasons,
            vec![
                ("empty.png", RejectReason::NoFace),
                ("group.png", RejectReason::MultipleFaces),
                ("glare.png", RejectReason::EncodeFailed),
                ("junk.bin", RejectReason::Unreadable),
            ]
        );
    }

    #[test]
    fn test_all_rejected_registers_nobody() {
        let (enroller, ledger, _gallery) = enroller();
        let err = enroller.enroll("Cy", &[photo("empty.png", &[[0, 0, 0]])]).unwrap_err();
        assert!(matches!(err, EnrollError::NoUsablePhoto(1, ref r) if r.len() == 1));
        assert!(ledger.students().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_photo_counted() {
        let (enroller, _ledger, gallery) = enroller();
        let report = enroller.enroll("Ada", &[photo("a.png", &[RED])]).unwrap();
        let again = enroller.add_photos(report.student.id, &[photo("a2.png", &[RED])]).unwrap();
        assert_eq!((again.accepted, again.duplicates), (0, 1));
        assert_eq!(gallery.read().unwrap().len(), 1);
    }

    #[test]
    fn test_retire_removes_from_gallery_and_rebuild() {
        let (enroller, ledger, gallery) = enroller();
        let ada = enroller.enroll("Ada", &[photo("a.png", &[RED])]).unwrap().student;
        enroller.enroll("Ben", &[photo("b.png", &[GREEN])]).unwrap();
        enroller.retire(ada.id).unwrap();
        assert_eq!(gallery.read().unwrap().student_count(), 1);

        assert_eq!(rebuild_gallery(&ledger, &gallery).unwrap(), 1);
        assert!(gallery.read().unwrap().query(&colour_embedding(RED), 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_model_mismatch_refused_before_storing() {
        let ledger = Arc::new(Ledger::open_in_memory(LedgerOptions::default()).unwrap());
        let gallery = GalleryIndex::new("other-model", Metric::Euclidean).shared();
        let enroller = Enroller::new(Arc::new(PixelDetector), Arc::new(ColourEncoder), ledger.clone(), gallery);
        let err = enroller.enroll("Ada", &[photo("a.png", &[RED])]).unwrap_err();
        assert!(matches!(err, EnrollError::Gallery(GalleryError::ModelVersionMismatch { .. })));
        assert!(ledger.students().unwrap().is_empty());
    }

    #[test]
    fn test_incompatible_embedding_never_stored() {
        let ledger = Arc::new(Ledger::open_in_memory(LedgerOptions::default()).unwrap());
        let gallery = GalleryIndex::new(MODEL, Metric::Euclidean).shared();
        let enroller = Enroller::new(Arc::new(PixelDetector), Arc::new(ShortBlueEncoder), ledger.clone(), gallery.clone());
        let ada = enroller.enroll("Ada", &[photo("a.png", &[RED])]).unwrap().student;

        let report = enroller
            .add_photos(ada.id, &[photo("blue.png", &[BLUE]), photo("green.png", &[GREEN])])
            .unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.student.embeddings, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].reason, RejectReason::Incompatible);

        let err = enroller.enroll("Ben", &[photo("b.png", &[BLUE])]).unwrap_err();
        assert!(matches!(err, EnrollError::NoUsablePhoto(1, _)));
        assert_eq!(ledger.students().unwrap().len(), 1);

        assert_eq!(rebuild_gallery(&ledger, &gallery).unwrap(), 2);
        assert!(!gallery.read().unwrap().is_corrupt());
    }

    #[test]
    fn test_rebuild_from_foreign_model_marks_corrupt() {
        let ledger = Ledger::open_in_memory(LedgerOptions::default()).unwrap();
        let ada = ledger.register_student("Ada", Utc::now()).unwrap();
        ledger.append_embedding(ada.id, &Embedding::new(vec![1.0, 0.0, 0.0], "legacy")).unwrap();
        let gallery = GalleryIndex::new(MODEL, Metric::Euclidean).shared();
        let err = rebuild_gallery(&ledger, &gallery).unwrap_err();
        assert!(matches!(err, EnrollError::Gallery(GalleryError::GalleryCorrupt(_))));
        assert!(gallery.read().unwrap().is_corrupt());
    }
}
