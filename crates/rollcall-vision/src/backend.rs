//! Capability traits for swappable face-recognition backends.
//!
//! The engine only ever talks to a [`FaceDetector`] and a [`FaceEncoder`];
//! the ONNX implementations in this crate are one backend among others.

use crate::types::{BoundingBox, Embedding, Metric};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no face detected in region")]
    NoFaceDetected,
    #[error("{0} faces found in a region expected to hold exactly one")]
    MultipleFacesInRegion(usize),
    #[error("detection failed: {0}")]
    Detect(#[from] DetectError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Locates face regions in a decoded frame.
pub trait FaceDetector: Send + Sync {
    /// Returns regions sorted by descending detection confidence.
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectError>;
}

/// Turns a single face region into an embedding.
///
/// Implementations are deterministic for a given model version.
pub trait FaceEncoder: Send + Sync {
    fn model_version(&self) -> &str;

    fn encode(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EncodeError>;

    /// Metric under which this model's embeddings are compared.
    fn metric(&self) -> Metric {
        Metric::Euclidean
    }
}

/// Encode a photo that must contain exactly one face (enrollment input).
pub fn encode_single_face(
    detector: &dyn FaceDetector,
    encoder: &dyn FaceEncoder,
    image: &RgbImage,
) -> Result<Embedding, EncodeError> {
    let faces = detector.detect(image)?;
    match faces.as_slice() {
        [] => Err(EncodeError::NoFaceDetected),
        [face] => encoder.encode(image, face),
        many => Err(EncodeError::MultipleFacesInRegion(many.len())),
    }
}
