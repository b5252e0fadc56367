//! Deterministic stand-ins for the model adapters and storage.
//!
//! `StubDetector` reports fixed boxes for images of a registered size.
//! `StubEmbedder` maps a crop's top-left pixel color to a fixed vector.
//! Together they let a test say "this image has these faces with these
//! embeddings" without loading any model.

use crate::blob::{BlobError, BlobStore};
use findme_core::detector::crop_faces;
use findme_core::{BoundingBox, Detector, DetectorError, Embedder, EmbedderError, Embedding, FaceCrop};
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::{self, Cursor};
use std::path::PathBuf;

#[derive(Default)]
pub struct StubDetector {
    faces: HashMap<(u32, u32), Vec<BoundingBox>>,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Images of `width`x`height` contain faces at `boxes`.
    pub fn with_image(mut self, width: u32, height: u32, boxes: Vec<BoundingBox>) -> Self {
        self.faces.insert((width, height), boxes);
        self
    }
}

impl Detector for StubDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceCrop>, DetectorError> {
        let boxes: Vec<(BoundingBox, f32)> = self
            .faces
            .get(&image.dimensions())
            .map(|b| b.iter().map(|bbox| (*bbox, 0.99)).collect())
            .unwrap_or_default();
        Ok(crop_faces(image, &boxes))
    }
}

pub struct StubEmbedder {
    dimension: usize,
    by_color: HashMap<[u8; 3], Vec<f32>>,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            by_color: HashMap::new(),
        }
    }

    /// Crops whose top-left pixel is `color` embed to `values`.
    pub fn with_face(mut self, color: [u8; 3], values: Vec<f32>) -> Self {
        self.by_color.insert(color, values);
        self
    }
}

impl Embedder for StubEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        let (width, height) = face.dimensions();
        if width == 0 || height == 0 {
            return Err(EmbedderError::EmptyCrop { width, height });
        }
        let color = face.get_pixel(0, 0).0;
        self.by_color
            .get(&color)
            .map(|values| Embedding {
                values: values.clone(),
                model_version: Some("stub".into()),
            })
            .ok_or_else(|| EmbedderError::InferenceFailed(format!("no stub embedding for color {color:?}")))
    }
}

/// Blob store whose writes always fail.
pub struct FailingBlobStore;

impl BlobStore for FailingBlobStore {
    fn put(&self, _bytes: &[u8], path: &str) -> Result<(), BlobError> {
        Err(BlobError::Io {
            path: PathBuf::from(path),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only store"),
        })
    }

    fn readable_url(&self, path: &str) -> Result<String, BlobError> {
        Ok(format!("mem://{path}"))
    }
}

/// A `width`x`height` gray image with solid colored face regions, PNG-encoded.
pub fn face_image(width: u32, height: u32, faces: &[(BoundingBox, [u8; 3])]) -> Vec<u8> {
    let mut image = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
    for (bbox, color) in faces {
        let x2 = ((bbox.x + bbox.width) as u32).min(width);
        let y2 = ((bbox.y + bbox.height) as u32).min(height);
        for y in bbox.y as u32..y2 {
            for x in bbox.x as u32..x2 {
                image.put_pixel(x, y, Rgb(*color));
            }
        }
    }
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("PNG encoding into a Vec");
    bytes
}

/// Embedding of length `dimension` with `head` in front and zeros after.
pub fn vector(dimension: usize, head: &[f32]) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[..head.len()].copy_from_slice(head);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_image_is_a_decodable_png() {
        let bbox = BoundingBox { x: 2.0, y: 3.0, width: 4.0, height: 4.0 };
        let bytes = face_image(10, 12, &[(bbox, [200, 10, 10])]);
        assert!(bytes.starts_with(b"\x89PNG"));

        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (10, 12));
        assert_eq!(decoded.get_pixel(3, 4), &Rgb([200, 10, 10]));
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([128, 128, 128]));
    }
}
