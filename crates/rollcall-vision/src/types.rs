use serde::{Deserialize, Serialize};

/// Face region detected in a frame, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// True when the box has positive area and overlaps a `width`×`height` frame.
    pub fn is_within(&self, width: u32, height: u32) -> bool {
        self.area() > 0.0
            && self.x < width as f32
            && self.y < height as f32
            && self.x + self.width > 0.0
            && self.y + self.height > 0.0
    }
}

/// Distance metric used to compare embeddings.
///
/// Both metrics expect L2-normalised vectors and yield distances in `[0, 2]`,
/// where 0 means identical direction. Thresholds are always expressed as a
/// maximum distance under the configured metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `‖a - b‖₂`.
    #[default]
    Euclidean,
    /// `1 - cos(a, b)`.
    Cosine,
}

impl Metric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f32>()
                .sqrt(),
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
        }
    }

    /// Largest distance two unit vectors can have under this metric.
    pub fn max_distance(self) -> f32 {
        2.0
    }

    /// Map a distance onto a `[0, 1]` confidence score (1 = identical).
    pub fn confidence(self, distance: f32) -> f32 {
        (1.0 - distance / self.max_distance()).clamp(0.0, 1.0)
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!("unknown metric '{other}' (expected euclidean or cosine)")),
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// Face embedding stamped with the model version that produced it.
///
/// Embeddings from different model versions live in different spaces and
/// must never be compared with each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub model_version: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: model_version.into(),
        }
    }

    /// Build an embedding after scaling `values` to unit length.
    pub fn normalized(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            values.into_iter().map(|v| v / norm).collect()
        } else {
            values
        };
        Self::new(values, model_version)
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    pub fn distance(&self, other: &Embedding, metric: Metric) -> f32 {
        metric.distance(&self.values, &other.values)
    }

    /// Bitwise equality of the vector, so `-0.0` and `0.0` are distinct and
    /// NaN payloads compare by representation.
    pub fn same_vector(&self, other: &Embedding) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), "test")
    }

    #[test]
    fn test_euclidean_identical_is_zero() {
        let a = emb(&[0.6, 0.8]);
        assert_eq!(a.distance(&a, Metric::Euclidean), 0.0);
    }

    #[test]
    fn test_euclidean_opposite_is_two() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.distance(&b, Metric::Euclidean) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_is_one() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!((a.distance(&b, Metric::Cosine) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert!((a.distance(&b, Metric::Cosine) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_range() {
        assert_eq!(Metric::Euclidean.confidence(0.0), 1.0);
        assert_eq!(Metric::Euclidean.confidence(2.0), 0.0);
        assert_eq!(Metric::Euclidean.confidence(5.0), 0.0);
        assert!((Metric::Cosine.confidence(1.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding::normalized(vec![3.0, 4.0], "v1");
        let norm: f32 = e.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert_eq!(e.model_version, "v1");
    }

    #[test]
    fn test_same_vector_is_bitwise() {
        assert!(emb(&[1.0, 2.0]).same_vector(&emb(&[1.0, 2.0])));
        assert!(!emb(&[0.0]).same_vector(&emb(&[-0.0])));
        assert!(!emb(&[1.0]).same_vector(&emb(&[1.0, 0.0])));
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("Cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert_eq!("l2".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert!("manhattan".parse::<Metric>().is_err());
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0, landmarks: None };
        let b = BoundingBox { x: 5.0, ..a.clone() };
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_is_within() {
        let b = BoundingBox { x: -5.0, y: 2.0, width: 10.0, height: 10.0, confidence: 1.0, landmarks: None };
        assert!(b.is_within(20, 20));
        let outside = BoundingBox { x: 30.0, ..b.clone() };
        assert!(!outside.is_within(20, 20));
        let empty = BoundingBox { width: 0.0, ..b };
        assert!(!empty.is_within(20, 20));
    }
}
