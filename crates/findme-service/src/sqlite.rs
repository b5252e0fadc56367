//! SQLite-backed catalog.
//!
//! Photos and reference faces are stored as JSON documents. The
//! `detections` table is the slot → photo reverse lookup and cascades away
//! with its photo, so a deleted photo leaves its slots dangling in the index
//! but unresolvable here.

use crate::catalog::{CatalogError, PhotoCatalog, PhotoRecord, ReferenceFace, ReferenceStore};
use chrono::SecondsFormat;
use findme_core::{Embedding, SlotId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS photos (
    id       TEXT PRIMARY KEY,
    status   TEXT NOT NULL,
    document TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS detections (
    slot_id  INTEGER PRIMARY KEY,
    photo_id TEXT NOT NULL REFERENCES photos(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS detections_photo ON detections(photo_id);
CREATE TABLE IF NOT EXISTS faces (
    id         TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    document   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS faces_user ON faces(user_id, created_at);
";

pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open (or create) the catalog database at `path`.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "catalog journal mode");
        tracing::info!(path = %path.display(), "opened photo catalog");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CatalogError> {
        self.conn.lock().map_err(|_| CatalogError::LockPoisoned)
    }
}

impl PhotoCatalog for SqliteCatalog {
    fn find_by_id(&self, id: &str) -> Result<Option<PhotoRecord>, CatalogError> {
        let conn = self.lock()?;
        let document: Option<String> = conn
            .query_row("SELECT document FROM photos WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        document
            .map(|d| serde_json::from_str(&d).map_err(CatalogError::from))
            .transpose()
    }

    fn find_by_slot_id(&self, slot_id: SlotId) -> Result<Option<PhotoRecord>, CatalogError> {
        let conn = self.lock()?;
        let document: Option<String> = conn
            .query_row(
                "SELECT p.document FROM detections d JOIN photos p ON p.id = d.photo_id WHERE d.slot_id = ?1",
                params![slot_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        document
            .map(|d| serde_json::from_str(&d).map_err(CatalogError::from))
            .transpose()
    }

    fn save(&self, photo: &PhotoRecord) -> Result<(), CatalogError> {
        let document = serde_json::to_string(photo)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for slot_id in photo.slot_ids() {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT photo_id FROM detections WHERE slot_id = ?1",
                    params![slot_id as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(owner) = owner.filter(|o| o != &photo.id) {
                return Err(CatalogError::SlotConflict {
                    slot_id,
                    photo_id: owner,
                });
            }
        }

        tx.execute(
            "INSERT INTO photos (id, status, document) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, document = excluded.document",
            params![photo.id, photo.status.as_str(), document],
        )?;
        tx.execute("DELETE FROM detections WHERE photo_id = ?1", params![photo.id])?;
        for slot_id in photo.slot_ids() {
            tx.execute(
                "INSERT INTO detections (slot_id, photo_id) VALUES (?1, ?2)",
                params![slot_id as i64, photo.id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, CatalogError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM photos WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn slot_embeddings(&self) -> Result<Vec<(SlotId, Option<Embedding>)>, CatalogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT document FROM photos WHERE id IN (SELECT DISTINCT photo_id FROM detections)",
        )?;
        let documents = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut slots = Vec::new();
        for document in &documents {
            let photo: PhotoRecord = serde_json::from_str(document)?;
            slots.extend(
                photo
                    .detections
                    .into_iter()
                    .filter_map(|d| d.slot_id.map(|slot| (slot, d.embedding))),
            );
        }
        slots.sort_by_key(|(slot, _)| *slot);
        Ok(slots)
    }
}

impl ReferenceStore for SqliteCatalog {
    fn save_reference(&self, face: &ReferenceFace) -> Result<(), CatalogError> {
        let document = serde_json::to_string(face)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO faces (id, user_id, created_at, document) VALUES (?1, ?2, ?3, ?4)",
            params![face.id, face.user_id, face.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true), document],
        )?;
        Ok(())
    }

    fn latest_reference(&self, user_id: &str) -> Result<Option<ReferenceFace>, CatalogError> {
        Ok(self.list_references(user_id)?.into_iter().next())
    }

    fn list_references(&self, user_id: &str) -> Result<Vec<ReferenceFace>, CatalogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT document FROM faces WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let documents = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        documents
            .iter()
            .map(|d| serde_json::from_str(d).map_err(CatalogError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{exercise_photo_catalog, exercise_reference_store, photo};

    #[test]
    fn test_sqlite_photo_catalog() {
        exercise_photo_catalog(&SqliteCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_reference_store() {
        exercise_reference_store(&SqliteCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        let saved = photo("p1", &[4, 5]);
        {
            let catalog = SqliteCatalog::open(&path).unwrap();
            catalog.save(&saved).unwrap();
        }

        let catalog = SqliteCatalog::open(&path).unwrap();
        assert_eq!(catalog.find_by_slot_id(5).unwrap().unwrap(), saved);
        assert!(catalog.delete("p1").unwrap());
        assert!(catalog.find_by_slot_id(4).unwrap().is_none());
    }
}
