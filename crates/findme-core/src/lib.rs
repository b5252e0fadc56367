//! findme-core — Face detection, embedding and similarity search.
//!
//! Uses SCRFD for face detection and FaceNet for face embeddings, both
//! running via ONNX Runtime, plus an append-only exact similarity index.

pub mod detector;
pub mod embedder;
pub mod index;
pub mod types;
pub mod watermark;

use std::path::PathBuf;

pub use detector::{decode_image, Detector, DetectorError, ScrfdDetector};
pub use embedder::{Embedder, EmbedderError, FaceNetEmbedder};
pub use index::{IndexError, IndexInfo, SearchHit, SimilarityIndex, VectorIndex};
pub use types::{BoundingBox, Detection, Embedding, FaceCrop, SlotId};
pub use watermark::{render_watermark, RenderError};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the FaceNet embedding model inside the model directory.
pub const EMBEDDER_MODEL_FILE: &str = "facenet512.onnx";

/// Default data directory: `$XDG_DATA_HOME/findme`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("findme")
}
