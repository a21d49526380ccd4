//! rollcall-vision — face detection and embedding backends.
//!
//! Defines the [`FaceDetector`] / [`FaceEncoder`] capability traits the
//! attendance engine is written against, plus the default SCRFD + ArcFace
//! implementation running on ONNX Runtime.

pub mod alignment;
pub mod backend;
pub mod detector;
pub mod recognizer;
pub mod types;

pub use backend::{encode_single_face, DetectError, EncodeError, FaceDetector, FaceEncoder};
pub use detector::ScrfdDetector;
pub use recognizer::ArcFaceEncoder;
pub use types::{BoundingBox, Embedding, Metric};

/// File name of the detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
