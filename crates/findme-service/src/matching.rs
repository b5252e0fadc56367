//! "Find me": search the marketplace for photos containing a user's face,
//! and manage the reference faces used as stored probes.

use crate::blob::{BlobError, BlobStore};
use crate::catalog::{CatalogError, PhotoCatalog, ReferenceFace, ReferenceStore};
use crate::indexing::blob_file_name;
use chrono::{DateTime, Utc};
use findme_core::{
    decode_image, BoundingBox, Detector, DetectorError, Embedder, EmbedderError, Embedding, IndexError, SlotId,
    VectorIndex,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("expected exactly one face, found {found}")]
    AmbiguousOrMissingFace { found: usize },
    #[error("no reference face registered")]
    NoReferenceFace,
    #[error("detector error: {0}")]
    Detection(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedding(#[from] EmbedderError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("blob storage error: {0}")]
    Blob(#[from] BlobError),
}

impl MatchError {
    /// Whether the caller can fix this by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MatchError::AmbiguousOrMissingFace { .. }
                | MatchError::NoReferenceFace
                | MatchError::Detection(DetectorError::Decode(_))
        )
    }
}

/// Where the query embedding comes from.
#[derive(Debug, Clone, Copy)]
pub enum Probe<'a> {
    /// A freshly uploaded image with exactly one face.
    Image(&'a [u8]),
    /// The user's most recently registered reference face.
    Stored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    /// Squared L2 distance a candidate must stay strictly below.
    pub threshold: f32,
    /// Maximum number of index hits to consider.
    pub limit: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            limit: 10,
        }
    }
}

/// A listed photo containing a face close to the probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoMatch {
    pub photo_id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub sell_price: u64,
    pub slot_id: SlotId,
    pub distance: f32,
    pub bbox: BoundingBox,
    /// Readable URL of the watermarked render for this face.
    pub crop_url: Option<String>,
}

/// A registered reference face as shown to its owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceSummary {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

pub struct MatchService {
    detector: Arc<dyn Detector>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    catalog: Arc<dyn PhotoCatalog>,
    references: Arc<dyn ReferenceStore>,
    blobs: Arc<dyn BlobStore>,
}

impl MatchService {
    pub fn new(
        detector: Arc<dyn Detector>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        catalog: Arc<dyn PhotoCatalog>,
        references: Arc<dyn ReferenceStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            detector,
            embedder,
            index,
            catalog,
            references,
            blobs,
        }
    }

    /// Listed photos containing a face within `options.threshold` of the
    /// probe, closest first, one entry per photo.
    ///
    /// Index hits whose photo is gone from the catalog or no longer listed
    /// are dropped; the index keeps every slot forever, so these are
    /// expected.
    pub fn find_matches(
        &self,
        user_id: &str,
        probe: Probe<'_>,
        options: &MatchOptions,
    ) -> Result<Vec<PhotoMatch>, MatchError> {
        let query = match probe {
            Probe::Image(bytes) => self.embed_single_face(user_id, bytes)?,
            Probe::Stored => {
                self.references
                    .latest_reference(user_id)?
                    .ok_or(MatchError::NoReferenceFace)?
                    .embedding
            }
        };

        let hits = self.index.search(&query, options.limit, options.threshold)?;
        let candidates = hits.len();

        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        for hit in hits {
            let Some(photo) = self.catalog.find_by_slot_id(hit.slot_id)? else {
                tracing::debug!(slot_id = hit.slot_id, "dropping dangling slot");
                continue;
            };
            if !photo.is_listed() {
                tracing::debug!(slot_id = hit.slot_id, photo_id = %photo.id, status = %photo.status, "dropping unlisted photo");
                continue;
            }
            let Some(detection) = photo.detection_for_slot(hit.slot_id) else {
                tracing::warn!(slot_id = hit.slot_id, photo_id = %photo.id, "catalog lookup returned photo without the slot");
                continue;
            };
            if let Some(stored) = &detection.embedding {
                if !agrees_with_hit(stored, &query, hit.distance) {
                    tracing::warn!(
                        slot_id = hit.slot_id,
                        photo_id = %photo.id,
                        distance = hit.distance,
                        stored_distance = stored.squared_distance(&query),
                        "index row differs from the catalog's embedding; dropping hit"
                    );
                    continue;
                }
            }
            // Hits arrive closest first, so the first one per photo is its best.
            if !seen.insert(photo.id.clone()) {
                continue;
            }
            let crop_url = detection
                .crop_url
                .as_deref()
                .map(|path| self.blobs.readable_url(path))
                .transpose()?;

            matches.push(PhotoMatch {
                slot_id: hit.slot_id,
                distance: hit.distance,
                bbox: detection.bbox,
                crop_url,
                photo_id: photo.id,
                owner_id: photo.owner_id,
                name: photo.name,
                description: photo.description,
                sell_price: photo.sell_price,
            });
        }

        tracing::info!(user_id, candidates, matches = matches.len(), "face search finished");
        Ok(matches)
    }

    /// Register `image` as a reference face for `user_id`.
    pub fn register_reference(
        &self,
        user_id: &str,
        image: &[u8],
        filename: &str,
    ) -> Result<ReferenceSummary, MatchError> {
        let embedding = self.embed_single_face(user_id, image)?;
        let expected = self.index.dimension();
        if embedding.dimension() != expected {
            return Err(IndexError::Dimension {
                expected,
                actual: embedding.dimension(),
            }
            .into());
        }

        let path = format!("faces/{}_{}", Uuid::new_v4(), blob_file_name(filename));
        self.blobs.put(image, &path)?;

        let face = ReferenceFace {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            url: path,
            embedding,
            created_at: Utc::now(),
        };
        self.references.save_reference(&face)?;
        tracing::info!(user_id, reference_id = %face.id, "registered reference face");
        self.summarize(face)
    }

    /// The user's reference faces, newest first.
    pub fn list_references(&self, user_id: &str) -> Result<Vec<ReferenceSummary>, MatchError> {
        self.references
            .list_references(user_id)?
            .into_iter()
            .map(|face| self.summarize(face))
            .collect()
    }

    fn summarize(&self, face: ReferenceFace) -> Result<ReferenceSummary, MatchError> {
        Ok(ReferenceSummary {
            url: self.blobs.readable_url(&face.url)?,
            id: face.id,
            user_id: face.user_id,
            created_at: face.created_at,
        })
    }

    fn embed_single_face(&self, user_id: &str, image: &[u8]) -> Result<Embedding, MatchError> {
        let decoded = decode_image(image)?;
        let mut faces = self.detector.detect(&decoded)?;
        if faces.len() != 1 {
            tracing::info!(user_id, found = faces.len(), "rejected probe image");
            return Err(MatchError::AmbiguousOrMissingFace { found: faces.len() });
        }
        let face = faces.remove(0);
        Ok(self.embedder.embed(&face.image)?)
    }
}

/// Whether the embedding stored with a detection reproduces the distance the
/// index reported for its slot.
fn agrees_with_hit(stored: &Embedding, query: &Embedding, distance: f32) -> bool {
    if stored.dimension() != query.dimension() {
        return false;
    }
    let expected = stored.squared_distance(query);
    (expected - distance).abs() <= 1e-4 * (1.0 + distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::catalog::{InMemoryCatalog, PhotoStatus};
    use crate::indexing::{IndexingService, PhotoListing};
    use crate::testing::{face_image, vector, StubDetector, StubEmbedder};
    use findme_core::SimilarityIndex;

    const DIM: usize = 8;
    const RED: [u8; 3] = [220, 30, 30];
    const BLUE: [u8; 3] = [30, 30, 220];
    const GREEN: [u8; 3] = [30, 220, 30];
    const NEAR: [u8; 3] = [250, 250, 250];
    const FAR: [u8; 3] = [10, 10, 10];

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h }
    }

    /// 100x100 photos hold one face, 120x80 two, 60x60 probes one,
    /// 50x50 none and 70x70 two.
    fn detector() -> StubDetector {
        StubDetector::new()
            .with_image(100, 100, vec![bbox(10.0, 10.0, 40.0, 40.0)])
            .with_image(120, 80, vec![bbox(10.0, 10.0, 30.0, 30.0), bbox(70.0, 20.0, 30.0, 30.0)])
            .with_image(60, 60, vec![bbox(5.0, 5.0, 30.0, 30.0)])
            .with_image(50, 50, vec![])
            .with_image(70, 70, vec![bbox(0.0, 0.0, 20.0, 20.0), bbox(40.0, 40.0, 20.0, 20.0)])
    }

    fn embedder() -> StubEmbedder {
        StubEmbedder::new(DIM)
            .with_face(RED, vector(DIM, &[1.0]))
            .with_face(BLUE, vector(DIM, &[1.1]))
            .with_face(GREEN, vector(DIM, &[1.3]))
    }

    struct Harness {
        _dir: tempfile::TempDir,
        index: Arc<SimilarityIndex>,
        catalog: Arc<InMemoryCatalog>,
        indexing: IndexingService,
        matching: MatchService,
    }

    fn services(
        index: Arc<SimilarityIndex>,
        catalog: Arc<InMemoryCatalog>,
        embedder: StubEmbedder,
    ) -> (IndexingService, MatchService) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let detector: Arc<dyn Detector> = Arc::new(detector());
        let embedder: Arc<dyn Embedder> = Arc::new(embedder);

        let indexing = IndexingService::new(
            detector.clone(),
            embedder.clone(),
            index.clone(),
            catalog.clone(),
            blobs.clone(),
        );
        let matching = MatchService::new(detector, embedder, index, catalog.clone(), catalog, blobs);
        (indexing, matching)
    }

    fn harness(embedder: StubEmbedder) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(SimilarityIndex::load(dir.path().join("faces.index"), DIM).unwrap());
        let catalog = Arc::new(InMemoryCatalog::new());
        let (indexing, matching) = services(index.clone(), catalog.clone(), embedder);
        Harness {
            _dir: dir,
            index,
            catalog,
            indexing,
            matching,
        }
    }

    fn listing(name: &str) -> PhotoListing {
        PhotoListing {
            name: name.into(),
            description: "race day".into(),
            base_price: 10_000,
            sell_price: 15_000,
            filename: format!("{name}.jpg"),
        }
    }

    fn index_one(h: &Harness, name: &str, color: [u8; 3]) -> String {
        let image = face_image(100, 100, &[(bbox(10.0, 10.0, 40.0, 40.0), color)]);
        h.indexing.index_photo("seller", &image, &listing(name)).unwrap().photo_id
    }

    fn probe(color: [u8; 3]) -> Vec<u8> {
        face_image(60, 60, &[(bbox(5.0, 5.0, 30.0, 30.0), color)])
    }

    #[test]
    fn test_end_to_end_match_and_miss() {
        let embedder = embedder()
            .with_face(NEAR, vector(DIM, &[1.0, 0.05f32.sqrt()]))
            .with_face(FAR, vector(DIM, &[1.0, 0.0, 2.0, 1.0]));
        let h = harness(embedder);
        let photo_id = index_one(&h, "finish", RED);

        let found = h
            .matching
            .find_matches("buyer", Probe::Image(&probe(NEAR)), &MatchOptions::default())
            .unwrap();
        assert_eq!(found.len(), 1);
        let top = &found[0];
        assert_eq!(top.photo_id, photo_id);
        assert_eq!(top.slot_id, 0);
        assert!((top.distance - 0.05).abs() < 1e-6);
        assert_eq!(top.name, "finish");
        assert_eq!(top.sell_price, 15_000);
        assert_eq!(top.bbox, bbox(10.0, 10.0, 40.0, 40.0));
        assert_eq!(top.crop_url.as_deref(), Some(format!("mem://photos/crops/{photo_id}/0.jpg").as_str()));

        let missed = h
            .matching
            .find_matches("buyer", Probe::Image(&probe(FAR)), &MatchOptions::default())
            .unwrap();
        assert!(missed.is_empty());
    }

    fn photo_ids(matches: &[PhotoMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.photo_id.as_str()).collect()
    }

    #[test]
    fn test_lost_index_file_keeps_slots_bound_to_their_photos() {
        let apart = || {
            StubEmbedder::new(DIM)
                .with_face(RED, vector(DIM, &[1.0]))
                .with_face(BLUE, vector(DIM, &[0.0, 5.0]))
        };
        let h = harness(apart());
        let red_photo = index_one(&h, "red", RED);

        std::fs::write(h.index.path(), b"\0\0 not an index").unwrap();
        let reloaded = Arc::new(SimilarityIndex::load(h.index.path(), DIM).unwrap());
        assert!(reloaded.is_empty());
        let (indexing, matching) = services(reloaded.clone(), h.catalog.clone(), apart());

        assert_eq!(indexing.restore_missing_slots().unwrap(), 1);
        let image = face_image(100, 100, &[(bbox(10.0, 10.0, 40.0, 40.0), BLUE)]);
        let blue = indexing.index_photo("seller", &image, &listing("blue")).unwrap();
        assert_eq!(blue.detections[0].slot_id, Some(1));
        assert_eq!(reloaded.len(), 2);

        let options = MatchOptions::default();
        let found = matching.find_matches("buyer", Probe::Image(&probe(BLUE)), &options).unwrap();
        assert_eq!(photo_ids(&found), vec![blue.photo_id.as_str()]);
        let found = matching.find_matches("buyer", Probe::Image(&probe(RED)), &options).unwrap();
        assert_eq!(photo_ids(&found), vec![red_photo.as_str()]);
    }

    #[test]
    fn test_hit_dropped_when_index_row_disagrees_with_catalog() {
        let h = harness(embedder());
        let red_photo = index_one(&h, "red", RED);
        let options = MatchOptions::default();

        // BLUE is close enough to RED to match through a consistent index.
        let found = h.matching.find_matches("buyer", Probe::Image(&probe(BLUE)), &options).unwrap();
        assert_eq!(photo_ids(&found), vec![red_photo.as_str()]);

        // An index whose slot 0 holds BLUE's vector while the catalog says RED.
        let drifted = Arc::new(SimilarityIndex::load(h._dir.path().join("drifted.index"), DIM).unwrap());
        drifted.add(&[Embedding::new(vector(DIM, &[1.1]))]).unwrap();
        let (_, matching) = services(drifted, h.catalog.clone(), embedder());

        let found = matching.find_matches("buyer", Probe::Image(&probe(BLUE)), &options).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_agrees_with_hit() {
        let stored = Embedding::new(vec![1.0, 2.0]);
        let query = Embedding::new(vec![1.0, 1.0]);
        assert!(agrees_with_hit(&stored, &query, 1.0));
        assert!(!agrees_with_hit(&stored, &query, 0.0));
        assert!(!agrees_with_hit(&stored, &query, f32::NAN));
        assert!(!agrees_with_hit(&Embedding::new(vec![1.0]), &query, 0.0));
    }

    #[test]
    fn test_deleted_photo_is_skipped_not_an_error() {
        let h = harness(embedder().with_face(NEAR, vector(DIM, &[1.1])));
        let a = index_one(&h, "a", RED);
        let b = index_one(&h, "b", BLUE);
        let c = index_one(&h, "c", GREEN);

        // The probe sits exactly on B, with A at 0.01 and C at 0.04.
        let all = h
            .matching
            .find_matches("buyer", Probe::Image(&probe(NEAR)), &MatchOptions::default())
            .unwrap();
        let ids: Vec<&str> = all.iter().map(|m| m.photo_id.as_str()).collect();
        assert_eq!(ids, vec![b.as_str(), a.as_str(), c.as_str()]);

        assert!(h.catalog.delete(&b).unwrap());
        assert_eq!(h.index.len(), 3);

        let remaining = h
            .matching
            .find_matches("buyer", Probe::Image(&probe(NEAR)), &MatchOptions::default())
            .unwrap();
        let ids: Vec<&str> = remaining.iter().map(|m| m.photo_id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), c.as_str()]);
        assert!(remaining.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_unlisted_photos_are_filtered() {
        let h = harness(embedder().with_face(NEAR, vector(DIM, &[1.0])));
        let sold = index_one(&h, "sold", RED);
        let withdrawn = index_one(&h, "withdrawn", BLUE);
        let listed = index_one(&h, "listed", GREEN);

        let mut record = h.catalog.find_by_id(&sold).unwrap().unwrap();
        record.status = PhotoStatus::Sold;
        record.buyer_id = Some("someone".into());
        h.catalog.save(&record).unwrap();

        let mut record = h.catalog.find_by_id(&withdrawn).unwrap().unwrap();
        record.deleted_at = Some(Utc::now());
        h.catalog.save(&record).unwrap();

        let found = h
            .matching
            .find_matches("buyer", Probe::Image(&probe(NEAR)), &MatchOptions::default())
            .unwrap();
        assert_eq!(found.iter().map(|m| m.photo_id.clone()).collect::<Vec<_>>(), vec![listed]);
    }

    #[test]
    fn test_photo_appears_once_at_closest_face() {
        let h = harness(embedder().with_face(NEAR, vector(DIM, &[1.1])));
        let image = face_image(
            120,
            80,
            &[(bbox(10.0, 10.0, 30.0, 30.0), RED), (bbox(70.0, 20.0, 30.0, 30.0), BLUE)],
        );
        let photo_id = h.indexing.index_photo("seller", &image, &listing("pair")).unwrap().photo_id;

        let found = h
            .matching
            .find_matches("buyer", Probe::Image(&probe(NEAR)), &MatchOptions::default())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].photo_id, photo_id);
        assert_eq!(found[0].slot_id, 1);
        assert_eq!(found[0].distance, 0.0);
    }

    #[test]
    fn test_threshold_and_limit_options() {
        let h = harness(embedder().with_face(NEAR, vector(DIM, &[1.1])));
        index_one(&h, "a", RED);
        let b = index_one(&h, "b", BLUE);
        index_one(&h, "c", GREEN);
        let image = probe(NEAR);

        let tight = MatchOptions {
            threshold: 0.005,
            limit: 10,
        };
        let found = h.matching.find_matches("buyer", Probe::Image(&image), &tight).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].photo_id, b);

        let one = MatchOptions { threshold: 0.8, limit: 1 };
        assert_eq!(h.matching.find_matches("buyer", Probe::Image(&image), &one).unwrap().len(), 1);
    }

    #[test]
    fn test_probe_must_have_exactly_one_face() {
        let h = harness(embedder());
        index_one(&h, "a", RED);

        let none = face_image(50, 50, &[]);
        let err = h
            .matching
            .find_matches("buyer", Probe::Image(&none), &MatchOptions::default())
            .unwrap_err();
        assert!(matches!(err, MatchError::AmbiguousOrMissingFace { found: 0 }));
        assert!(err.is_client_error());

        let two = face_image(70, 70, &[(bbox(0.0, 0.0, 20.0, 20.0), RED), (bbox(40.0, 40.0, 20.0, 20.0), BLUE)]);
        let err = h
            .matching
            .find_matches("buyer", Probe::Image(&two), &MatchOptions::default())
            .unwrap_err();
        assert!(matches!(err, MatchError::AmbiguousOrMissingFace { found: 2 }));

        let err = h.matching.register_reference("buyer", &two, "me.jpg").unwrap_err();
        assert!(matches!(err, MatchError::AmbiguousOrMissingFace { found: 2 }));
    }

    #[test]
    fn test_stored_probe_uses_registered_reference() {
        let h = harness(embedder().with_face(NEAR, vector(DIM, &[1.0])));
        let photo_id = index_one(&h, "a", RED);

        let err = h
            .matching
            .find_matches("buyer", Probe::Stored, &MatchOptions::default())
            .unwrap_err();
        assert!(matches!(err, MatchError::NoReferenceFace));
        assert!(err.is_client_error());

        let summary = h.matching.register_reference("buyer", &probe(NEAR), "selfie.png").unwrap();
        assert_eq!(summary.user_id, "buyer");
        assert!(summary.url.starts_with("mem://faces/"));
        assert!(summary.url.ends_with("_selfie.png"));
        assert_eq!(h.index.len(), 1);

        let found = h
            .matching
            .find_matches("buyer", Probe::Stored, &MatchOptions::default())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].photo_id, photo_id);
        assert_eq!(found[0].distance, 0.0);

        // Another user's reference is not used.
        assert!(matches!(
            h.matching.find_matches("someone-else", Probe::Stored, &MatchOptions::default()),
            Err(MatchError::NoReferenceFace)
        ));
    }

    #[test]
    fn test_list_references() {
        let h = harness(embedder().with_face(NEAR, vector(DIM, &[1.0])));
        let first = h.matching.register_reference("buyer", &probe(NEAR), "one.jpg").unwrap();
        let second = h.matching.register_reference("buyer", &probe(NEAR), "two.jpg").unwrap();

        let listed = h.matching.list_references("buyer").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], second);
        assert_eq!(listed[1], first);
        assert!(h.matching.list_references("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_reference_dimension_mismatch() {
        let wrong = StubEmbedder::new(DIM + 2).with_face(NEAR, vector(DIM + 2, &[1.0]));
        let h = harness(wrong);
        let err = h.matching.register_reference("buyer", &probe(NEAR), "me.jpg").unwrap_err();
        assert!(matches!(err, MatchError::Index(IndexError::Dimension { .. })));
        assert!(!err.is_client_error());
        assert!(h.matching.list_references("buyer").unwrap().is_empty());
    }
}
