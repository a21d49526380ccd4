//! Deterministic fake backends for unit tests.
//!
//! Test frames are one pixel high. Every non-black pixel is a "face" whose
//! embedding is its normalised colour; pure white pixels fail to encode.

use image::{DynamicImage, ImageFormat, RgbImage};
use rollcall_vision::{BoundingBox, DetectError, EncodeError, Embedding, FaceDetector, FaceEncoder};
use std::io::Cursor;

pub const MODEL: &str = "fake-v1";

pub const RED: [u8; 3] = [255, 0, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];
pub const WHITE: [u8; 3] = [255, 255, 255];

pub struct PixelDetector;

impl FaceDetector for PixelDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectError> {
        Ok(image
            .enumerate_pixels()
            .filter(|(_, y, p)| *y == 0 && p.0 != [0, 0, 0])
            .map(|(x, _, _)| BoundingBox {
                x: x as f32,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                confidence: 0.99,
                landmarks: None,
            })
            .collect())
    }
}

pub struct ColourEncoder;

impl FaceEncoder for ColourEncoder {
    fn model_version(&self) -> &str {
        MODEL
    }

    fn encode(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EncodeError> {
        let pixel = image
            .get_pixel_checked(face.x as u32, face.y as u32)
            .ok_or(EncodeError::NoFaceDetected)?;
        if pixel.0 == WHITE {
            return Err(EncodeError::InferenceFailed("overexposed".into()));
        }
        Ok(Embedding::normalized(pixel.0.iter().map(|&c| c as f32).collect(), MODEL))
    }
}

/// Like [`ColourEncoder`], but blue faces come out two-dimensional.
pub struct ShortBlueEncoder;

impl FaceEncoder for ShortBlueEncoder {
    fn model_version(&self) -> &str {
        MODEL
    }

    fn encode(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EncodeError> {
        let embedding = ColourEncoder.encode(image, face)?;
        if embedding.values == colour_embedding(BLUE).values {
            return Ok(Embedding::normalized(vec![0.0, 1.0], MODEL));
        }
        Ok(embedding)
    }
}

/// PNG bytes of a one-row image with the given pixel colours.
pub fn png(pixels: &[[u8; 3]]) -> Vec<u8> {
    let width = pixels.len().max(1) as u32;
    let image = RgbImage::from_fn(width, 1, |x, _| {
        image::Rgb(pixels.get(x as usize).copied().unwrap_or([0, 0, 0]))
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

pub fn colour_embedding(colour: [u8; 3]) -> Embedding {
    Embedding::normalized(colour.iter().map(|&c| c as f32).collect(), MODEL)
}
