//! Face embedding.
//!
//! [`FaceNetEmbedder`] turns a face crop into a fixed-length descriptor with a
//! FaceNet ONNX export: 160x160 NHWC input, per-image standardization.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_MODEL_VERSION: &str = "facenet512";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face crop is empty ({width}x{height})")]
    EmptyCrop { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    UnexpectedShape { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces a fixed-length embedding from a single face crop.
///
/// Deterministic for a fixed model and input.
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    fn embed(&self, face: &RgbImage) -> Result<Embedding, EmbedderError>;
}

/// FaceNet-based face embedder.
pub struct FaceNetEmbedder {
    session: Mutex<Session>,
    dimension: usize,
    l2_normalize: bool,
}

impl FaceNetEmbedder {
    /// Load the FaceNet ONNX model from the given path.
    ///
    /// `dimension` is the expected output length; inference producing any
    /// other length fails instead of being padded or truncated.
    pub fn load(model_path: &str, dimension: usize, l2_normalize: bool) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            dimension,
            l2_normalize,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self {
            session: Mutex::new(session),
            dimension,
            l2_normalize,
        })
    }

    /// Resize to 160x160 and standardize into a NHWC float tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = FACENET_INPUT_SIZE as usize;
        let resized = imageops::resize(face, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, FilterType::Triangle);

        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32;
            }
        }

        // Freshly allocated arrays are always in standard layout
        if let Some(values) = tensor.as_slice_mut() {
            standardize(values);
        }
        tensor
    }
}

impl Embedder for FaceNetEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        let (width, height) = face.dimensions();
        if width == 0 || height == 0 {
            return Err(EmbedderError::EmptyCrop { width, height });
        }

        let input = Self::preprocess(face);

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedderError::InferenceFailed("embedder session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != self.dimension {
            return Err(EmbedderError::UnexpectedShape {
                expected: self.dimension,
                actual: raw_data.len(),
            });
        }

        let embedding = Embedding {
            values: raw_data.to_vec(),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        };

        Ok(if self.l2_normalize {
            embedding.l2_normalized()
        } else {
            embedding
        })
    }
}

/// Per-image standardization: `(x - mean) / max(stddev, 1/sqrt(N))`.
///
/// The lower bound on the divisor keeps uniform images finite.
pub fn standardize(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let adjusted_std = variance.sqrt().max(1.0 / n.sqrt());

    for v in values.iter_mut() {
        *v = (*v - mean) / adjusted_std;
    }
}
