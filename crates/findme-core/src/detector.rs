//! Face detection.
//!
//! [`Detector`] is the capability the services depend on; [`ScrfdDetector`]
//! implements it with the SCRFD (Sample and Computation Redistribution for
//! Efficient Face Detection) model: 3-stride anchor decoding followed by NMS.

use crate::types::{BoundingBox, FaceCrop};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a decoded color image.
///
/// Implementations return one [`FaceCrop`] per face with its box clamped to
/// the image (`x, y >= 0`). No faces is an empty list, not an error.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceCrop>, DetectorError>;
}

/// Decode encoded image bytes (JPEG, PNG, ...) into an RGB image.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DetectorError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Clamp raw boxes to the image and cut out the face crops.
///
/// Boxes that fall entirely outside the image are dropped.
pub fn crop_faces(image: &RgbImage, faces: &[(BoundingBox, f32)]) -> Vec<FaceCrop> {
    faces
        .iter()
        .filter_map(|(raw, confidence)| {
            let bbox = raw.clamp_to(image.width(), image.height())?;
            let crop = imageops::crop_imm(
                image,
                bbox.x as u32,
                bbox.y as u32,
                (bbox.width as u32).max(1),
                (bbox.height as u32).max(1),
            )
            .to_image();
            Some(FaceCrop {
                image: crop,
                bbox,
                confidence: *confidence,
            })
        })
        .collect()
}

/// Scale and padding applied when letterboxing into the model input.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    /// Map a point in model-input space back to the source image.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// A decoded candidate before NMS.
#[derive(Debug, Clone)]
struct ScoredBox {
    bbox: BoundingBox,
    confidence: f32,
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    // `Session::run` needs `&mut`; the lock lets one loaded model serve
    // concurrent requests.
    session: Mutex<Session>,
    input_size: usize,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // Variants with keypoints export 9 tensors, box-only variants 6.
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            input_size: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Letterbox an RGB image into a normalized NCHW tensor.
    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let size = self.input_size;
        let (width, height) = (image.width() as f32, image.height() as f32);
        let scale = (size as f32 / width).min(size as f32 / height);

        let new_w = ((width * scale).round() as u32).clamp(1, size as u32);
        let new_h = ((height * scale).round() as u32).clamp(1, size as u32);
        let pad_x = (size as u32 - new_w) as f32 / 2.0;
        let pad_y = (size as u32 - new_h) as f32 / 2.0;

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        // Padding is SCRFD_MEAN, which normalizes to 0.0
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = x as usize + pad_x_start;
            let ty = y as usize + pad_y_start;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl Detector for ScrfdDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceCrop>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(image);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("detector session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let kept: Vec<(BoundingBox, f32)> = nms(candidates, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .map(|c| (c.bbox, c.confidence))
            .collect();

        let faces = crop_faces(image, &kept);
        tracing::debug!(faces = faces.len(), width = image.width(), height = image.height(), "SCRFD detection");
        Ok(faces)
    }
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) are mapped directly. Otherwise
/// falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    let mut all_named = true;
    for (i, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => named[i] = (score, bbox),
            _ => {
                all_named = false;
                break;
            }
        }
    }

    if all_named {
        tracing::info!("SCRFD: using name-based output tensor mapping");
        named
    } else {
        tracing::info!(
            ?names,
            "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
        );
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Decode one stride level's anchors into boxes in source-image pixels.
///
/// Each grid cell carries `SCRFD_ANCHORS_PER_CELL` anchors; box outputs are
/// `[left, top, right, bottom]` distances from the cell origin, in strides.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<ScoredBox> {
    let grid = input_size / stride;
    let anchors = (grid * grid * SCRFD_ANCHORS_PER_CELL).min(scores.len());
    let step = stride as f32;

    (0..anchors)
        .filter(|&i| scores[i] > threshold)
        .filter_map(|i| {
            let d = bboxes.get(i * 4..i * 4 + 4)?;
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);
            Some(ScoredBox {
                bbox: BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                },
                confidence: scores[i],
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut candidates: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<ScoredBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
