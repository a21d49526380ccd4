//! In-memory gallery of enrolled reference embeddings.
//!
//! The gallery is an explicit object handed to whoever needs it (one per
//! classroom if desired). Every entry is stamped with the gallery's model
//! version; embeddings from another model are refused rather than compared.

use crate::types::StudentId;
use rollcall_vision::{Embedding, Metric};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("embedding from model '{found}' cannot be compared with gallery model '{expected}'")]
    ModelVersionMismatch { expected: String, found: String },
    #[error("embedding has {found} dimensions, gallery holds {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("embedding is empty or contains non-finite values")]
    InvalidEmbedding,
    #[error("gallery is corrupt ({0}); rebuild before matching")]
    GalleryCorrupt(String),
    #[error("gallery lock poisoned")]
    Poisoned,
}

/// A stored reference embedding, as loaded from the student table.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub student_id: StudentId,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GalleryHit {
    pub student_id: StudentId,
    pub distance: f32,
}

/// Concurrent handle: lookups share the read lock, enrollment and rebuild
/// take the write lock and therefore never interleave.
pub type SharedGallery = Arc<RwLock<GalleryIndex>>;

#[derive(Debug)]
pub struct GalleryIndex {
    model_version: String,
    metric: Metric,
    dim: Option<usize>,
    entries: Vec<Enrollment>,
    corrupt: Option<String>,
}

impl GalleryIndex {
    pub fn new(model_version: impl Into<String>, metric: Metric) -> Self {
        Self {
            model_version: model_version.into(),
            metric,
            dim: None,
            entries: Vec::new(),
            corrupt: None,
        }
    }

    pub fn shared(self) -> SharedGallery {
        Arc::new(RwLock::new(self))
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Number of reference embeddings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn student_count(&self) -> usize {
        let mut ids: Vec<StudentId> = self.entries.iter().map(|e| e.student_id).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt.is_some()
    }

    /// Dimension shared by every entry; `None` while empty.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// Whether `embedding` could be added next to entries of dimension `dim`.
    pub(crate) fn check(&self, embedding: &Embedding, dim: Option<usize>) -> Result<(), GalleryError> {
        if embedding.model_version != self.model_version {
            return Err(GalleryError::ModelVersionMismatch {
                expected: self.model_version.clone(),
                found: embedding.model_version.clone(),
            });
        }
        if embedding.values.is_empty() || !embedding.is_finite() {
            return Err(GalleryError::InvalidEmbedding);
        }
        match dim {
            Some(expected) if expected != embedding.dim() => Err(GalleryError::DimensionMismatch {
                expected,
                found: embedding.dim(),
            }),
            _ => Ok(()),
        }
    }

    fn contains(entries: &[Enrollment], student_id: StudentId, embedding: &Embedding) -> bool {
        entries
            .iter()
            .any(|e| e.student_id == student_id && e.embedding.same_vector(embedding))
    }

    /// Append a reference embedding. Returns `false` when the student already
    /// holds this exact vector.
    pub fn add(&mut self, student_id: StudentId, embedding: Embedding) -> Result<bool, GalleryError> {
        self.check(&embedding, self.dim)?;
        if Self::contains(&self.entries, student_id, &embedding) {
            return Ok(false);
        }
        self.dim = Some(embedding.dim());
        self.entries.push(Enrollment { student_id, embedding });
        Ok(true)
    }

    /// Drop every reference of a retired student. Returns how many were removed.
    pub fn remove_student(&mut self, student_id: StudentId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.student_id != student_id);
        if self.entries.is_empty() {
            self.dim = None;
        }
        before - self.entries.len()
    }

    /// Empty the index and refuse queries until the next successful rebuild.
    pub fn mark_corrupt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(reason = %reason, "gallery marked corrupt");
        self.entries.clear();
        self.dim = None;
        self.corrupt = Some(reason);
    }

    /// Replace the whole index from the student table.
    ///
    /// On any malformed entry the index is emptied and marked corrupt: it
    /// refuses queries until a later rebuild succeeds.
    pub fn rebuild<I>(&mut self, enrollments: I) -> Result<usize, GalleryError>
    where
        I: IntoIterator<Item = Enrollment>,
    {
        let mut entries: Vec<Enrollment> = Vec::new();
        let mut dim = None;
        for enrollment in enrollments {
            if let Err(err) = self.check(&enrollment.embedding, dim) {
                let reason = format!("student {}: {err}", enrollment.student_id);
                self.mark_corrupt(reason.clone());
                return Err(GalleryError::GalleryCorrupt(reason));
            }
            dim = Some(enrollment.embedding.dim());
            if !Self::contains(&entries, enrollment.student_id, &enrollment.embedding) {
                entries.push(enrollment);
            }
        }

        self.entries = entries;
        self.dim = dim;
        self.corrupt = None;
        tracing::info!(
            embeddings = self.entries.len(),
            students = self.student_count(),
            model = %self.model_version,
            "gallery rebuilt"
        );
        Ok(self.entries.len())
    }

    /// Students whose closest reference lies within `max_distance`, closest
    /// first. Equal distances are ordered by ascending student id.
    pub fn query(&self, sample: &Embedding, max_distance: f32) -> Result<Vec<GalleryHit>, GalleryError> {
        let mut hits = self.ranked(sample)?;
        hits.retain(|h| h.distance <= max_distance);
        Ok(hits)
    }

    /// Closest student regardless of threshold.
    pub fn nearest(&self, sample: &Embedding) -> Result<Option<GalleryHit>, GalleryError> {
        Ok(self.ranked(sample)?.into_iter().next())
    }

    fn ranked(&self, sample: &Embedding) -> Result<Vec<GalleryHit>, GalleryError> {
        if let Some(reason) = &self.corrupt {
            return Err(GalleryError::GalleryCorrupt(reason.clone()));
        }
        self.check(sample, self.dim)?;

        let mut best: BTreeMap<StudentId, f32> = BTreeMap::new();
        for entry in &self.entries {
            let d = sample.distance(&entry.embedding, self.metric);
            best.entry(entry.student_id)
                .and_modify(|cur| *cur = cur.min(d))
                .or_insert(d);
        }

        let mut hits: Vec<GalleryHit> = best
            .into_iter()
            .map(|(student_id, distance)| GalleryHit { student_id, distance })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.student_id.cmp(&b.student_id))
        });
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "test-v1";

    fn emb(values: &[f32]) -> Embedding {
        Embedding::normalized(values.to_vec(), MODEL)
    }

    fn gallery() -> GalleryIndex {
        let mut g = GalleryIndex::new(MODEL, Metric::Euclidean);
        g.add(StudentId(1), emb(&[1.0, 0.0, 0.0])).unwrap();
        g.add(StudentId(2), emb(&[0.0, 1.0, 0.0])).unwrap();
        g.add(StudentId(3), emb(&[0.0, 0.0, 1.0])).unwrap();
        g
    }

    #[test]
    fn test_enrolled_vector_is_top_match() {
        let g = gallery();
        let hits = g.query(&emb(&[0.0, 1.0, 0.0]), 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].student_id, StudentId(2));
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_query_ascending_and_thresholded() {
        let g = gallery();
        let sample = emb(&[0.9, 0.3, 0.0]);
        let hits = g.query(&sample, 1.2).unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.student_id).collect();
        assert_eq!(ids, vec![StudentId(1), StudentId(2)]);
        assert!(hits[0].distance < hits[1].distance);
        assert!(g.query(&sample, 0.01).unwrap().is_empty());
    }

    #[test]
    fn test_tie_break_lower_id_wins() {
        let mut g = GalleryIndex::new(MODEL, Metric::Euclidean);
        g.add(StudentId(9), emb(&[0.0, 1.0])).unwrap();
        g.add(StudentId(4), emb(&[1.0, 0.0])).unwrap();
        let sample = emb(&[1.0, 1.0]);
        for _ in 0..3 {
            let hits = g.query(&sample, 2.0).unwrap();
            assert_eq!(hits[0].distance, hits[1].distance);
            assert_eq!(hits[0].student_id, StudentId(4));
            assert_eq!(hits[1].student_id, StudentId(9));
        }
    }

    #[test]
    fn test_one_hit_per_student_using_closest_reference() {
        let mut g = GalleryIndex::new(MODEL, Metric::Euclidean);
        g.add(StudentId(1), emb(&[0.0, 1.0])).unwrap();
        g.add(StudentId(1), emb(&[1.0, 0.0])).unwrap();
        let hits = g.query(&emb(&[1.0, 0.0]), 2.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let mut g = gallery();
        assert!(!g.add(StudentId(1), emb(&[1.0, 0.0, 0.0])).unwrap());
        assert_eq!(g.len(), 3);
        // Same vector for another student is a distinct reference.
        assert!(g.add(StudentId(2), emb(&[1.0, 0.0, 0.0])).unwrap());
    }

    #[test]
    fn test_model_version_mismatch() {
        let mut g = gallery();
        let foreign = Embedding::new(vec![1.0, 0.0, 0.0], "other");
        assert!(matches!(g.query(&foreign, 1.0), Err(GalleryError::ModelVersionMismatch { .. })));
        assert!(matches!(g.add(StudentId(5), foreign), Err(GalleryError::ModelVersionMismatch { .. })));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut g = gallery();
        assert!(matches!(
            g.add(StudentId(5), emb(&[1.0, 0.0])),
            Err(GalleryError::DimensionMismatch { expected: 3, found: 2 })
        ));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let mut g = gallery();
        let enrollments: Vec<Enrollment> = vec![
            Enrollment { student_id: StudentId(1), embedding: emb(&[1.0, 0.0]) },
            Enrollment { student_id: StudentId(2), embedding: emb(&[0.0, 1.0]) },
            Enrollment { student_id: StudentId(2), embedding: emb(&[0.0, 1.0]) },
        ];
        assert_eq!(g.rebuild(enrollments.clone()).unwrap(), 2);
        let first = g.query(&emb(&[1.0, 0.2]), 2.0).unwrap();
        assert_eq!(g.rebuild(enrollments).unwrap(), 2);
        assert_eq!(g.query(&emb(&[1.0, 0.2]), 2.0).unwrap(), first);
        assert_eq!(g.student_count(), 2);
    }

    #[test]
    fn test_corrupt_rebuild_refuses_queries() {
        let mut g = gallery();
        let bad = vec![
            Enrollment { student_id: StudentId(1), embedding: emb(&[1.0, 0.0]) },
            Enrollment { student_id: StudentId(2), embedding: Embedding::new(vec![f32::NAN, 0.0], MODEL) },
        ];
        assert!(matches!(g.rebuild(bad), Err(GalleryError::GalleryCorrupt(_))));
        assert!(g.is_corrupt());
        assert!(g.is_empty());
        assert!(matches!(g.query(&emb(&[1.0, 0.0]), 2.0), Err(GalleryError::GalleryCorrupt(_))));

        g.rebuild(vec![Enrollment { student_id: StudentId(1), embedding: emb(&[1.0, 0.0]) }])
            .unwrap();
        assert!(!g.is_corrupt());
        assert_eq!(g.query(&emb(&[1.0, 0.0]), 0.0).unwrap()[0].student_id, StudentId(1));
    }

    #[test]
    fn test_remove_student() {
        let mut g = gallery();
        assert_eq!(g.remove_student(StudentId(2)), 1);
        assert_eq!(g.student_count(), 2);
        assert!(g.query(&emb(&[0.0, 1.0, 0.0]), 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_nearest_ignores_threshold() {
        let g = gallery();
        let hit = g.nearest(&emb(&[1.0, 1.0, 0.1])).unwrap().unwrap();
        assert_eq!(hit.student_id, StudentId(1));
        assert!(GalleryIndex::new(MODEL, Metric::Cosine).nearest(&emb(&[1.0])).unwrap().is_none());
    }
}
