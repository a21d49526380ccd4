//! ArcFace face encoder via ONNX Runtime.
//!
//! Aligns each detected face onto the canonical 112×112 crop and extracts a
//! 512-dimensional, L2-normalised embedding with the w600k_r50 model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::backend::{EncodeError, FaceEncoder};
use crate::types::{BoundingBox, Embedding, Metric};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5; // symmetric, unlike SCRFD
pub const EMBEDDING_DIM: usize = 512;
pub const MODEL_VERSION: &str = "w600k_r50";

pub struct ArcFaceEncoder {
    session: Mutex<Session>,
    metric: Metric,
}

impl ArcFaceEncoder {
    pub fn load(model_path: &Path, metric: Metric) -> Result<Self, EncodeError> {
        if !model_path.exists() {
            return Err(EncodeError::InferenceFailed(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(load_failed)?
            .with_intra_threads(2)
            .map_err(load_failed)?
            .commit_from_file(model_path)
            .map_err(load_failed)?;

        tracing::info!(path = %model_path.display(), ?metric, "loaded ArcFace model");

        Ok(Self {
            session: Mutex::new(session),
            metric,
        })
    }

    /// NCHW float tensor from an aligned RGB crop.
    fn input_tensor(crop: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
            }
        }
        tensor
    }
}

fn load_failed(err: impl std::fmt::Display) -> EncodeError {
    EncodeError::InferenceFailed(format!("loading ArcFace: {err}"))
}

impl FaceEncoder for ArcFaceEncoder {
    fn model_version(&self) -> &str {
        MODEL_VERSION
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn encode(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EncodeError> {
        if !face.is_within(image.width(), image.height()) {
            return Err(EncodeError::NoFaceDetected);
        }
        let landmarks = face.landmarks.as_ref().ok_or(EncodeError::NoFaceDetected)?;
        let crop = alignment::align_face(image, landmarks).ok_or(EncodeError::NoFaceDetected)?;
        let input = Self::input_tensor(&crop);

        let mut session = self
            .session
            .lock()
            .map_err(|_| EncodeError::InferenceFailed("ArcFace session lock poisoned".into()))?;
        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| EncodeError::InferenceFailed(e.to_string()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| EncodeError::InferenceFailed(e.to_string()))?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncodeError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EncodeError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::normalized(raw.to_vec(), MODEL_VERSION))
    }
}
