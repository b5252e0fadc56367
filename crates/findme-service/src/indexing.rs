//! Indexing of newly uploaded sellable photos.

use crate::blob::{BlobError, BlobStore};
use crate::catalog::{CatalogError, PhotoCatalog, PhotoRecord, PhotoStatus};
use chrono::Utc;
use findme_core::{
    decode_image, render_watermark, Detection, Detector, DetectorError, Embedder, EmbedderError, Embedding,
    IndexError, RenderError, SlotId, VectorIndex,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_WATERMARK_MAX_SIDE: u32 = 1024;

#[derive(Error, Debug)]
pub enum IndexingError {
    #[error("invalid listing: {0}")]
    InvalidListing(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector error: {0}")]
    Detection(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedding(#[from] EmbedderError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("render error: {0}")]
    Render(#[from] RenderError),
    #[error("blob storage error: {0}")]
    Blob(#[from] BlobError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl IndexingError {
    /// Whether the uploader can fix this by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IndexingError::InvalidListing(_)
                | IndexingError::NoFaceDetected
                | IndexingError::Detection(DetectorError::Decode(_))
        )
    }
}

/// Seller-supplied metadata for a photo being put up for sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoListing {
    pub name: String,
    pub description: String,
    pub base_price: u64,
    pub sell_price: u64,
    /// Original upload file name, used in the stored blob path.
    pub filename: String,
}

impl PhotoListing {
    fn validate(&self) -> Result<(), IndexingError> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.description.trim().is_empty() {
            missing.push("description");
        }
        if self.base_price == 0 {
            missing.push("base_price");
        }
        if self.sell_price == 0 {
            missing.push("sell_price");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IndexingError::InvalidListing(format!("{} required", missing.join(", "))))
        }
    }
}

/// Outcome of indexing one photo. Detections carry no embeddings.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedPhoto {
    pub photo_id: String,
    pub detections: Vec<Detection>,
}

/// Detect → embed → store → index → catalog, for one uploaded photo.
pub struct IndexingService {
    detector: Arc<dyn Detector>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    catalog: Arc<dyn PhotoCatalog>,
    blobs: Arc<dyn BlobStore>,
    watermark_max_side: u32,
}

impl IndexingService {
    pub fn new(
        detector: Arc<dyn Detector>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        catalog: Arc<dyn PhotoCatalog>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            detector,
            embedder,
            index,
            catalog,
            blobs,
            watermark_max_side: DEFAULT_WATERMARK_MAX_SIDE,
        }
    }

    pub fn with_watermark_max_side(mut self, max_side: u32) -> Self {
        self.watermark_max_side = max_side;
        self
    }

    /// Re-add slots the catalog references but the index no longer holds.
    ///
    /// Happens when the index file was lost or quarantined while the catalog
    /// survived. Without it, new adds would reuse slot ids that still belong
    /// to older photos. Rows come back from the embeddings stored on each
    /// detection, in slot order; a slot with no usable embedding (freed by a
    /// deleted photo, or stored at another dimension) gets a NaN row, which
    /// never matches. Returns the number of rows appended.
    pub fn restore_missing_slots(&self) -> Result<usize, IndexingError> {
        let referenced = self.catalog.slot_embeddings()?;
        let Some(&(highest, _)) = referenced.last() else {
            return Ok(0);
        };
        let held = self.index.len() as SlotId;
        if held > highest {
            return Ok(0);
        }

        let dimension = self.index.dimension();
        let mut stored: HashMap<SlotId, Embedding> = referenced
            .into_iter()
            .filter(|(slot, _)| *slot >= held)
            .filter_map(|(slot, embedding)| embedding.map(|e| (slot, e)))
            .collect();

        let mut placeholders = 0usize;
        let rows: Vec<Embedding> = (held..=highest)
            .map(|slot| match stored.remove(&slot) {
                Some(embedding) if embedding.dimension() == dimension => embedding,
                _ => {
                    placeholders += 1;
                    Embedding::new(vec![f32::NAN; dimension])
                }
            })
            .collect();

        let slots = self.index.add(&rows)?;
        tracing::warn!(
            first_slot = slots.first().copied(),
            restored = rows.len() - placeholders,
            placeholders,
            "index was behind the catalog; restored slots from stored embeddings"
        );
        Ok(rows.len())
    }

    /// Index a sellable photo for `owner_id` and write its catalog record.
    ///
    /// Every face is embedded before anything is stored, and the index add is
    /// the last step before the catalog write: any earlier failure leaves the
    /// index untouched, and the catalog never references a slot the index
    /// does not hold yet. A photo without faces is rejected.
    pub fn index_photo(
        &self,
        owner_id: &str,
        image: &[u8],
        listing: &PhotoListing,
    ) -> Result<IndexedPhoto, IndexingError> {
        if owner_id.trim().is_empty() {
            return Err(IndexingError::InvalidListing("owner id required".into()));
        }
        listing.validate()?;

        let decoded = decode_image(image)?;
        let faces = self.detector.detect(&decoded)?;
        if faces.is_empty() {
            tracing::info!(owner_id, "rejected sell photo without faces");
            return Err(IndexingError::NoFaceDetected);
        }
        tracing::debug!(
            owner_id,
            confidences = ?faces.iter().map(|f| f.confidence).collect::<Vec<_>>(),
            "detected faces"
        );

        let embeddings = faces
            .iter()
            .map(|face| self.embedder.embed(&face.image))
            .collect::<Result<Vec<Embedding>, _>>()?;

        let expected = self.index.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.dimension() != expected) {
            return Err(IndexError::Dimension {
                expected,
                actual: bad.dimension(),
            }
            .into());
        }

        let photo_id = Uuid::new_v4().to_string();
        let original_path = format!("photos/sell/{}_{}", Uuid::new_v4(), blob_file_name(&listing.filename));
        self.blobs.put(image, &original_path)?;

        let mut crop_paths = Vec::with_capacity(faces.len());
        for (i, face) in faces.iter().enumerate() {
            let rendered = render_watermark(&decoded, &face.bbox, self.watermark_max_side)?;
            let path = format!("photos/crops/{photo_id}/{i}.jpg");
            self.blobs.put(&rendered, &path)?;
            crop_paths.push(path);
        }

        let slot_ids = self.index.add(&embeddings)?;

        let detections: Vec<Detection> = faces
            .iter()
            .zip(embeddings)
            .zip(slot_ids.iter().zip(crop_paths))
            .map(|((face, embedding), (&slot_id, crop_url))| Detection {
                embedding: Some(embedding),
                bbox: face.bbox,
                slot_id: Some(slot_id),
                crop_url: Some(crop_url),
            })
            .collect();

        let now = Utc::now();
        let record = PhotoRecord {
            id: photo_id.clone(),
            owner_id: owner_id.to_string(),
            name: listing.name.clone(),
            description: listing.description.clone(),
            base_price: listing.base_price,
            sell_price: listing.sell_price,
            url: original_path,
            status: PhotoStatus::Available,
            buyer_id: None,
            detections,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        if let Err(err) = self.catalog.save(&record) {
            tracing::error!(
                photo_id = %photo_id,
                slots = ?slot_ids,
                error = %err,
                "catalog write failed after index add; slots left dangling"
            );
            return Err(err.into());
        }

        tracing::info!(
            photo_id = %photo_id,
            owner_id,
            faces = record.detections.len(),
            slots = ?slot_ids,
            "indexed sell photo"
        );

        Ok(IndexedPhoto {
            photo_id,
            detections: record.detections.iter().map(Detection::stripped).collect(),
        })
    }
}

/// Last path component of an uploaded file name, restricted to characters
/// that are safe in a blob path.
pub(crate) fn blob_file_name(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
