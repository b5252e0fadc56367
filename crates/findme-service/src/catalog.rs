//! Photo catalog and reference-face documents.
//!
//! The catalog is the single source of truth for whether a photo still
//! qualifies as a match result. It also owns the reverse lookup from index
//! slot ids to the photo whose detection claimed them.

use chrono::{DateTime, Utc};
use findme_core::{Detection, Embedding, SlotId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("document encoding: {0}")]
    Document(#[from] serde_json::Error),
    #[error("slot {slot_id} already belongs to photo {photo_id}")]
    SlotConflict { slot_id: SlotId, photo_id: String },
    #[error("catalog lock poisoned")]
    LockPoisoned,
}

/// Sale state of a marketplace photo. Transitions are owned by the
/// transaction subsystem; this crate only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoStatus {
    Available,
    Reserved,
    Sold,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoStatus::Available => "available",
            PhotoStatus::Reserved => "reserved",
            PhotoStatus::Sold => "sold",
        }
    }
}

impl fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhotoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(PhotoStatus::Available),
            "reserved" => Ok(PhotoStatus::Reserved),
            "sold" => Ok(PhotoStatus::Sold),
            other => Err(format!("unknown photo status: {other}")),
        }
    }
}

/// A sellable photo as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    /// Prices are in the smallest currency unit.
    pub base_price: u64,
    pub sell_price: u64,
    /// Blob path of the unwatermarked original.
    pub url: String,
    pub status: PhotoStatus,
    pub buyer_id: Option<String>,
    pub detections: Vec<Detection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the photo is withdrawn from the marketplace.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PhotoRecord {
    /// Whether the photo may be shown in match results right now.
    pub fn is_listed(&self) -> bool {
        self.status == PhotoStatus::Available && self.deleted_at.is_none()
    }

    pub fn detection_for_slot(&self, slot_id: SlotId) -> Option<&Detection> {
        self.detections.iter().find(|d| d.slot_id == Some(slot_id))
    }

    pub fn slot_ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.detections.iter().filter_map(|d| d.slot_id)
    }
}

/// A user's registered face, used as the stored probe for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFace {
    pub id: String,
    pub user_id: String,
    /// Blob path of the uploaded reference image.
    pub url: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// Photo document store.
pub trait PhotoCatalog: Send + Sync {
    fn find_by_id(&self, id: &str) -> Result<Option<PhotoRecord>, CatalogError>;

    /// Photo whose detections reference `slot_id`, if it still exists.
    fn find_by_slot_id(&self, slot_id: SlotId) -> Result<Option<PhotoRecord>, CatalogError>;

    /// Insert or replace a photo. Fails with `SlotConflict` if one of its
    /// slot ids is already claimed by another photo.
    fn save(&self, photo: &PhotoRecord) -> Result<(), CatalogError>;

    /// Remove a photo and its slot references. Returns whether it existed.
    fn delete(&self, id: &str) -> Result<bool, CatalogError>;

    /// Every referenced slot with the embedding its detection stored,
    /// ordered by slot id.
    fn slot_embeddings(&self) -> Result<Vec<(SlotId, Option<Embedding>)>, CatalogError>;
}

/// Store of users' reference faces.
pub trait ReferenceStore: Send + Sync {
    fn save_reference(&self, face: &ReferenceFace) -> Result<(), CatalogError>;

    /// Most recently registered reference for the user.
    fn latest_reference(&self, user_id: &str) -> Result<Option<ReferenceFace>, CatalogError>;

    /// All references for the user, newest first.
    fn list_references(&self, user_id: &str) -> Result<Vec<ReferenceFace>, CatalogError>;
}

#[derive(Default)]
struct MemoryState {
    photos: HashMap<String, PhotoRecord>,
    slots: HashMap<SlotId, String>,
    references: Vec<ReferenceFace>,
}

/// Catalog held entirely in memory.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<MemoryState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhotoCatalog for InMemoryCatalog {
    fn find_by_id(&self, id: &str) -> Result<Option<PhotoRecord>, CatalogError> {
        let state = self.state.read().map_err(|_| CatalogError::LockPoisoned)?;
        Ok(state.photos.get(id).cloned())
    }

    fn find_by_slot_id(&self, slot_id: SlotId) -> Result<Option<PhotoRecord>, CatalogError> {
        let state = self.state.read().map_err(|_| CatalogError::LockPoisoned)?;
        Ok(state
            .slots
            .get(&slot_id)
            .and_then(|photo_id| state.photos.get(photo_id))
            .cloned())
    }

    fn save(&self, photo: &PhotoRecord) -> Result<(), CatalogError> {
        let mut state = self.state.write().map_err(|_| CatalogError::LockPoisoned)?;

        for slot_id in photo.slot_ids() {
            if let Some(owner) = state.slots.get(&slot_id) {
                if owner != &photo.id {
                    return Err(CatalogError::SlotConflict {
                        slot_id,
                        photo_id: owner.clone(),
                    });
                }
            }
        }

        state.slots.retain(|_, owner| owner != &photo.id);
        for slot_id in photo.slot_ids() {
            state.slots.insert(slot_id, photo.id.clone());
        }
        state.photos.insert(photo.id.clone(), photo.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, CatalogError> {
        let mut state = self.state.write().map_err(|_| CatalogError::LockPoisoned)?;
        state.slots.retain(|_, owner| owner != id);
        Ok(state.photos.remove(id).is_some())
    }

    fn slot_embeddings(&self) -> Result<Vec<(SlotId, Option<Embedding>)>, CatalogError> {
        let state = self.state.read().map_err(|_| CatalogError::LockPoisoned)?;
        let mut slots: Vec<(SlotId, Option<Embedding>)> = state
            .photos
            .values()
            .flat_map(|photo| photo.detections.iter())
            .filter_map(|d| d.slot_id.map(|slot| (slot, d.embedding.clone())))
            .collect();
        slots.sort_by_key(|(slot, _)| *slot);
        Ok(slots)
    }
}

impl ReferenceStore for InMemoryCatalog {
    fn save_reference(&self, face: &ReferenceFace) -> Result<(), CatalogError> {
        let mut state = self.state.write().map_err(|_| CatalogError::LockPoisoned)?;
        state.references.retain(|r| r.id != face.id);
        state.references.push(face.clone());
        Ok(())
    }

    fn latest_reference(&self, user_id: &str) -> Result<Option<ReferenceFace>, CatalogError> {
        Ok(self.list_references(user_id)?.into_iter().next())
    }

    fn list_references(&self, user_id: &str) -> Result<Vec<ReferenceFace>, CatalogError> {
        let state = self.state.read().map_err(|_| CatalogError::LockPoisoned)?;
        let mut faces: Vec<ReferenceFace> = state
            .references
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        // Stable: equal timestamps keep the later registration first.
        faces.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(faces)
    }
}
