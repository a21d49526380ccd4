//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB frame into the 640×640 model input, decodes the three
//! anchor-free stride heads (scores, box distances, keypoints) and merges
//! overlapping detections with greedy NMS.

use crate::backend::{DetectError, FaceDetector};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    resized_w: u32,
    resized_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let resized_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let resized_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            pad_x: ((INPUT_SIZE - resized_w) / 2) as f32,
            pad_y: ((INPUT_SIZE - resized_h) / 2) as f32,
            resized_w,
            resized_h,
        }
    }

    /// Model-input coordinates back to frame coordinates.
    fn to_frame(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions (score, bbox, kps) for one stride.
type HeadIndices = (usize, usize, usize);

pub struct ScrfdDetector {
    session: Mutex<Session>,
    heads: [HeadIndices; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectError> {
        if !model_path.exists() {
            return Err(DetectError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()
            .map_err(load_failed)?
            .with_intra_threads(2)
            .map_err(load_failed)?
            .commit_from_file(model_path)
            .map_err(load_failed)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (3 strides x score/bbox/kps), model has {}",
                names.len()
            )));
        }
        let heads = head_indices(&names);

        tracing::info!(path = %model_path.display(), outputs = ?names, ?heads, "loaded SCRFD model");

        Ok(Self {
            session: Mutex::new(session),
            heads,
        })
    }

    fn input_tensor(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
        let size = INPUT_SIZE as usize;
        let resized = imageops::resize(image, letterbox.resized_w, letterbox.resized_h, FilterType::Triangle);
        // Padding normalises to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, oy + y as usize, ox + x as usize]] = (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
            }
        }
        tensor
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(image.width(), image.height());
        let input = Self::input_tensor(image, &letterbox);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectError::InferenceFailed("SCRFD session lock poisoned".into()))?;
        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectError::InferenceFailed(e.to_string()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| DetectError::InferenceFailed(e.to_string()))?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in STRIDES.iter().zip(self.heads.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let heads = StrideHeads {
                scores: extract(score_idx, "scores")?,
                boxes: extract(bbox_idx, "boxes")?,
                keypoints: extract(kps_idx, "keypoints")?,
            };
            candidates.extend(heads.decode(stride, &letterbox, SCORE_THRESHOLD));
        }

        let faces = nms(candidates, NMS_IOU);
        tracing::debug!(faces = faces.len(), "SCRFD detection");
        Ok(faces)
    }
}

fn load_failed(err: impl std::fmt::Display) -> DetectError {
    DetectError::InferenceFailed(format!("loading SCRFD: {err}"))
}

/// Locate each stride's heads by name ("score_8", "bbox_16", ...), falling
/// back to the standard export order [scores 8/16/32, boxes, keypoints].
fn head_indices(names: &[String]) -> [HeadIndices; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named: Option<Vec<HeadIndices>> = STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

struct StrideHeads<'a> {
    scores: &'a [f32],
    boxes: &'a [f32],
    keypoints: &'a [f32],
}

impl StrideHeads<'_> {
    fn decode(&self, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let cols = INPUT_SIZE as usize / stride;
        let step = stride as f32;
        let mut faces = Vec::new();

        for (anchor, &score) in self.scores.iter().enumerate() {
            if score <= threshold {
                continue;
            }
            let Some(dist) = self.boxes.get(anchor * 4..anchor * 4 + 4) else {
                continue;
            };
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cols) as f32 * step;
            let cy = (cell / cols) as f32 * step;

            let (x1, y1) = letterbox.to_frame((cx - dist[0] * step, cy - dist[1] * step));
            let (x2, y2) = letterbox.to_frame((cx + dist[2] * step, cy + dist[3] * step));

            let landmarks = self.keypoints.get(anchor * 10..anchor * 10 + 10).map(|kps| {
                std::array::from_fn(|i| letterbox.to_frame((cx + kps[i * 2] * step, cy + kps[i * 2 + 1] * step)))
            });

            faces.push(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            });
        }
        faces
    }
}

/// Greedy non-maximum suppression; output sorted by descending confidence.
fn nms(mut faces: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| k.iou(&face) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}
