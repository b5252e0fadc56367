use crate::blob::FsBlobStore;
use crate::catalog::CatalogError;
use crate::config::Config;
use crate::indexing::{IndexedPhoto, IndexingError, IndexingService, PhotoListing};
use crate::matching::{MatchError, MatchOptions, MatchService, PhotoMatch, Probe, ReferenceSummary};
use crate::sqlite::SqliteCatalog;
use findme_core::{
    DetectorError, EmbedderError, FaceNetEmbedder, IndexError, ScrfdDetector, SimilarityIndex, VectorIndex,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Indexing(#[from] IndexingError),
    #[error(transparent)]
    Matching(#[from] MatchError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("engine worker failed: {0}")]
    WorkerFailed(String),
}

impl EngineError {
    pub fn is_client_error(&self) -> bool {
        match self {
            EngineError::Indexing(e) => e.is_client_error(),
            EngineError::Matching(e) => e.is_client_error(),
            _ => false,
        }
    }
}

/// Index size and shape, for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub slots: usize,
    pub dimension: usize,
}

struct Engine {
    indexing: IndexingService,
    matching: MatchService,
    index: Arc<dyn VectorIndex>,
    defaults: MatchOptions,
}

/// Clone-safe async handle to the services.
///
/// Model inference and index persistence block, so every call runs on the
/// blocking thread pool.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Engine>,
}

impl EngineHandle {
    pub fn new(
        indexing: IndexingService,
        matching: MatchService,
        index: Arc<dyn VectorIndex>,
        defaults: MatchOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Engine {
                indexing,
                matching,
                index,
                defaults,
            }),
        }
    }

    /// Match options used when a caller does not supply its own.
    pub fn default_options(&self) -> MatchOptions {
        self.inner.defaults
    }

    pub async fn index_photo(
        &self,
        owner_id: String,
        image: Vec<u8>,
        listing: PhotoListing,
    ) -> Result<IndexedPhoto, EngineError> {
        self.run(move |engine| engine.indexing.index_photo(&owner_id, &image, &listing))
            .await
    }

    /// Search with a live probe image, or with the user's stored reference
    /// when `image` is `None`.
    pub async fn find_matches(
        &self,
        user_id: String,
        image: Option<Vec<u8>>,
        options: Option<MatchOptions>,
    ) -> Result<Vec<PhotoMatch>, EngineError> {
        self.run(move |engine| {
            let probe = match &image {
                Some(bytes) => Probe::Image(bytes),
                None => Probe::Stored,
            };
            let options = options.unwrap_or(engine.defaults);
            engine.matching.find_matches(&user_id, probe, &options)
        })
        .await
    }

    pub async fn register_reference(
        &self,
        user_id: String,
        image: Vec<u8>,
        filename: String,
    ) -> Result<ReferenceSummary, EngineError> {
        self.run(move |engine| engine.matching.register_reference(&user_id, &image, &filename))
            .await
    }

    pub async fn list_references(&self, user_id: String) -> Result<Vec<ReferenceSummary>, EngineError> {
        self.run(move |engine| engine.matching.list_references(&user_id))
            .await
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus {
            slots: self.inner.index.len(),
            dimension: self.inner.index.dimension(),
        }
    }

    async fn run<T, E, F>(&self, job: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        E: Into<EngineError> + Send + 'static,
        F: FnOnce(&Engine) -> Result<T, E> + Send + 'static,
    {
        let engine = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || job(&engine))
            .await
            .map_err(|e| EngineError::WorkerFailed(e.to_string()))?
            .map_err(Into::into)
    }
}

/// Load models, the index, the catalog and blob storage described by
/// `config`. Fails fast if any of them is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = Arc::new(ScrfdDetector::load(&detector_path)?);
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    let embedder_path = config.embedder_model_path();
    let embedder = Arc::new(FaceNetEmbedder::load(
        &embedder_path,
        config.embedding_dim,
        config.l2_normalize,
    )?);
    tracing::info!(
        path = %embedder_path,
        dimension = config.embedding_dim,
        l2_normalize = config.l2_normalize,
        "FaceNet embedder loaded"
    );

    let index = Arc::new(
        SimilarityIndex::load(config.index_path(), config.embedding_dim)?
            .with_persist_attempts(config.persist_attempts),
    );

    let catalog_path = config.catalog_path();
    if let Some(parent) = catalog_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| EngineError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let catalog = Arc::new(SqliteCatalog::open(&catalog_path)?);
    let blobs = Arc::new(FsBlobStore::new(config.blob_dir(), config.blob_base_url.clone()));

    let indexing = IndexingService::new(
        detector.clone(),
        embedder.clone(),
        index.clone(),
        catalog.clone(),
        blobs.clone(),
    )
    .with_watermark_max_side(config.watermark_max_side);
    // Must run before the first add, or new photos would take over old slot ids.
    let restored = indexing.restore_missing_slots()?;
    if restored > 0 {
        tracing::info!(restored, slots = index.len(), "similarity index caught up with the catalog");
    }
    let matching = MatchService::new(detector, embedder, index.clone(), catalog.clone(), catalog, blobs);

    let defaults = MatchOptions {
        threshold: config.match_threshold,
        limit: config.match_limit,
    };
    tracing::info!(slots = index.len(), threshold = defaults.threshold, limit = defaults.limit, "engine ready");
    Ok(EngineHandle::new(indexing, matching, index, defaults))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::catalog::InMemoryCatalog;
    use crate::testing::{face_image, vector, StubDetector, StubEmbedder};
    use findme_core::{BoundingBox, Detector, Embedder};

    const DIM: usize = 4;
    const RED: [u8; 3] = [220, 30, 30];
    const NEAR: [u8; 3] = [250, 250, 250];

    fn bbox() -> BoundingBox {
        BoundingBox {
            x: 4.0,
            y: 4.0,
            width: 20.0,
            height: 20.0,
        }
    }

    fn engine(dir: &tempfile::TempDir) -> EngineHandle {
        let detector: Arc<dyn Detector> = Arc::new(StubDetector::new().with_image(40, 40, vec![bbox()]));
        let embedder: Arc<dyn Embedder> = Arc::new(
            StubEmbedder::new(DIM)
                .with_face(RED, vector(DIM, &[1.0]))
                .with_face(NEAR, vector(DIM, &[1.0, 0.1])),
        );
        let index = Arc::new(SimilarityIndex::load(dir.path().join("faces.index"), DIM).unwrap());
        let catalog = Arc::new(InMemoryCatalog::new());
        let blobs = Arc::new(InMemoryBlobStore::new());

        let indexing = IndexingService::new(
            detector.clone(),
            embedder.clone(),
            index.clone(),
            catalog.clone(),
            blobs.clone(),
        );
        let matching = MatchService::new(detector, embedder, index.clone(), catalog.clone(), catalog, blobs);
        EngineHandle::new(indexing, matching, index, MatchOptions::default())
    }

    fn listing() -> PhotoListing {
        PhotoListing {
            name: "start line".into(),
            description: "wave 2".into(),
            base_price: 100,
            sell_price: 150,
            filename: "start.jpg".into(),
        }
    }

    #[tokio::test]
    async fn test_index_then_match() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir);
        let photo = face_image(40, 40, &[(bbox(), RED)]);

        let indexed = handle
            .index_photo("seller".into(), photo, listing())
            .await
            .unwrap();
        assert_eq!(handle.status(), IndexStatus { slots: 1, dimension: DIM });

        let probe = face_image(40, 40, &[(bbox(), NEAR)]);
        let found = handle
            .clone()
            .find_matches("buyer".into(), Some(probe.clone()), None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].photo_id, indexed.photo_id);

        let strict = MatchOptions {
            threshold: 0.001,
            limit: 10,
        };
        let none = handle
            .find_matches("buyer".into(), Some(probe), Some(strict))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_stored_probe_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir);

        let err = handle.find_matches("buyer".into(), None, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Matching(MatchError::NoReferenceFace)));
        assert!(err.is_client_error());

        handle
            .register_reference("buyer".into(), face_image(40, 40, &[(bbox(), NEAR)]), "me.png".into())
            .await
            .unwrap();
        handle
            .index_photo("seller".into(), face_image(40, 40, &[(bbox(), RED)]), listing())
            .await
            .unwrap();

        let found = handle.find_matches("buyer".into(), None, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(handle.list_references("buyer".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_indexing_assigns_distinct_slots() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir);

        let jobs: Vec<_> = (0..6)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    handle
                        .index_photo("seller".into(), face_image(40, 40, &[(bbox(), RED)]), listing())
                        .await
                })
            })
            .collect();

        let mut slots = Vec::new();
        for job in jobs {
            let indexed = job.await.unwrap().unwrap();
            slots.extend(indexed.detections.iter().filter_map(|d| d.slot_id));
        }
        slots.sort_unstable();
        assert_eq!(slots, (0..6).collect::<Vec<_>>());
        assert_eq!(handle.status().slots, 6);
    }

    #[tokio::test]
    async fn test_client_errors_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir);
        let err = handle
            .index_photo("seller".into(), face_image(10, 10, &[]), listing())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Indexing(IndexingError::NoFaceDetected)));
        assert!(err.is_client_error());
    }
}
