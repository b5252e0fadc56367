use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Permanent position of an embedding in the similarity index.
pub type SlotId = u64;

/// Face bounding box in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Clamp the box to an image of the given size.
    ///
    /// `x` and `y` are clamped to >= 0 and the far edges to the image bounds.
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<BoundingBox> {
        let max_x = image_width as f32;
        let max_y = image_height as f32;

        let x1 = self.x.max(0.0).min(max_x);
        let y1 = self.y.max(0.0).min(max_y);
        let x2 = (self.x + self.width).max(0.0).min(max_x);
        let y2 = (self.y + self.height).max(0.0).min(max_y);

        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }

        Some(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }

    /// Uniformly scale all coordinates (used when the image is resized).
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}

/// One face located by a detector: the RGB crop plus where it came from.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub image: RgbImage,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Face embedding vector (512-dimensional for the bundled FaceNet export).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet512").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Squared Euclidean distance. Extra trailing values of the longer
    /// vector are ignored; callers check dimensions first.
    pub fn squared_distance(&self, other: &Embedding) -> f32 {
        squared_l2(&self.values, &other.values)
    }

    /// Return a unit-length copy. A zero vector is returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }
}

/// Squared Euclidean distance between two equal-length slices.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// One face found in one marketplace photo.
///
/// Lives inside the owning photo's catalog document. The embedding is kept
/// there for re-indexing but must be stripped before a detection is handed
/// to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub slot_id: Option<SlotId>,
    /// Blob path of the watermarked render used for match thumbnails.
    pub crop_url: Option<String>,
}

impl Detection {
    /// Copy of this detection without its embedding, safe to return to clients.
    pub fn stripped(&self) -> Detection {
        Detection {
            embedding: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_negative_origin() {
        let clamped = bbox(-10.0, -5.0, 50.0, 40.0).clamp_to(100, 100).unwrap();
        assert_eq!(clamped, bbox(0.0, 0.0, 40.0, 35.0));
    }

    #[test]
    fn test_clamp_far_edge() {
        let clamped = bbox(80.0, 90.0, 50.0, 50.0).clamp_to(100, 100).unwrap();
        assert_eq!(clamped, bbox(80.0, 90.0, 20.0, 10.0));
    }

    #[test]
    fn test_clamp_outside_image() {
        assert!(bbox(150.0, 10.0, 20.0, 20.0).clamp_to(100, 100).is_none());
        assert!(bbox(-40.0, 10.0, 20.0, 20.0).clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_squared_distance() {
        let a = Embedding::new(vec![0.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 2.0, 2.0]);
        assert!((a.squared_distance(&b) - 9.0).abs() < 1e-6);
        assert_eq!(a.squared_distance(&a), 0.0);
    }

    #[test]
    fn test_l2_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]).l2_normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);

        let zero = Embedding::new(vec![0.0, 0.0]).l2_normalized();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_detection_stripped_drops_embedding() {
        let det = Detection {
            embedding: Some(Embedding::new(vec![1.0, 2.0])),
            bbox: bbox(1.0, 2.0, 3.0, 4.0),
            slot_id: Some(7),
            crop_url: Some("photos/crops/p/0.jpg".into()),
        };
        let stripped = det.stripped();
        assert!(stripped.embedding.is_none());
        assert_eq!(stripped.slot_id, Some(7));

        let json = serde_json::to_value(&stripped).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["box"]["width"], 3.0);
    }
}
