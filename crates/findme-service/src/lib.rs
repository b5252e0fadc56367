//! findme-service — Photo indexing and face matching over the core models.
//!
//! The services are synchronous; [`EngineHandle`] runs them on tokio's
//! blocking pool for async callers.

pub mod blob;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod indexing;
pub mod matching;
pub mod sqlite;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use blob::{BlobError, BlobStore, FsBlobStore, InMemoryBlobStore};
pub use catalog::{
    CatalogError, InMemoryCatalog, PhotoCatalog, PhotoRecord, PhotoStatus, ReferenceFace, ReferenceStore,
};
pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle, IndexStatus};
pub use indexing::{IndexedPhoto, IndexingError, IndexingService, PhotoListing};
pub use matching::{MatchError, MatchOptions, MatchService, PhotoMatch, Probe, ReferenceSummary};
pub use sqlite::SqliteCatalog;
