//! Append-only similarity index over face embeddings.
//!
//! Slot ids are insertion positions and are never reused: deleting or
//! selling a photo never touches the index. Callers resolve slots back to
//! photos through the catalog and drop the ones that no longer qualify.
//!
//! [`SimilarityIndex`] is an exact squared-L2 scan. Every `add` rewrites the
//! index file before the new slots become visible in memory, so the file on
//! disk always holds exactly the acknowledged adds.
//!
//! File layout (little-endian):
//! ```text
//! | "FMIX" | version u32 | dimension u32 | count u64 | count*dimension f32 | sha256 of all preceding bytes |
//! ```

use crate::types::{squared_l2, Embedding, SlotId};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

const INDEX_MAGIC: &[u8; 4] = b"FMIX";
const INDEX_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const DIGEST_LEN: usize = 32;
const DEFAULT_PERSIST_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("embedding dimension {actual} does not match index dimension {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("index dimension must be non-zero")]
    ZeroDimension,
    #[error("failed to persist index to {path} after {attempts} attempt(s): {source}")]
    Persist {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("corrupt index file: {0}")]
    Corrupt(String),
    #[error("failed to read index {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("index lock poisoned")]
    LockPoisoned,
}

/// Shape of an index file, as reported by [`SimilarityIndex::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    pub dimension: usize,
    pub slots: usize,
}

/// One search candidate: a slot and its squared Euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub slot_id: SlotId,
    pub distance: f32,
}

/// An append-only nearest-neighbour index.
///
/// Implementations must hand out slot ids `len, len+1, ...` in call order and
/// never reassign them. `search` returns hits with `distance < threshold`,
/// closest first, lower slot id first on ties, at most `k` of them.
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append all embeddings or none of them.
    fn add(&self, embeddings: &[Embedding]) -> Result<Vec<SlotId>, IndexError>;

    fn search(&self, query: &Embedding, k: usize, threshold: f32) -> Result<Vec<SearchHit>, IndexError>;
}

/// Exact flat index persisted to a single file.
pub struct SimilarityIndex {
    path: PathBuf,
    dimension: usize,
    persist_attempts: u32,
    /// Row-major embeddings, `dimension` floats per slot.
    slots: RwLock<Vec<f32>>,
    /// Serializes "assign slots + persist" across concurrent adds.
    writer: Mutex<()>,
}

impl SimilarityIndex {
    /// Open the index stored at `path`, or start empty.
    ///
    /// A missing file starts an empty index. An unreadable, corrupt or
    /// wrong-dimension file is logged, moved aside to
    /// `<path>.corrupt-<timestamp>` and also yields an empty index; the index
    /// can be rebuilt by re-adding, so startup never fails on it.
    pub fn load(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, IndexError> {
        if dimension == 0 {
            return Err(IndexError::ZeroDimension);
        }
        let path = path.into();

        let data = match fs::read(&path) {
            Ok(bytes) => match decode_index(&bytes, dimension) {
                Ok(data) => {
                    tracing::info!(
                        path = %path.display(),
                        dimension,
                        slots = data.len() / dimension,
                        "loaded similarity index"
                    );
                    data
                }
                Err(err) => {
                    let quarantined = quarantine(&path);
                    tracing::error!(
                        path = %path.display(),
                        error = %err,
                        quarantined = ?quarantined,
                        "similarity index unusable; starting with an empty index"
                    );
                    Vec::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), dimension, "no index file; starting with an empty index");
                Vec::new()
            }
            Err(err) => {
                tracing::error!(
                    path = %path.display(),
                    error = %err,
                    "failed to read similarity index; starting with an empty index"
                );
                Vec::new()
            }
        };

        Ok(Self {
            path,
            dimension,
            persist_attempts: DEFAULT_PERSIST_ATTEMPTS,
            slots: RwLock::new(data),
            writer: Mutex::new(()),
        })
    }

    /// Number of times a failed index write is attempted before `add` gives up.
    pub fn with_persist_attempts(mut self, attempts: u32) -> Self {
        self.persist_attempts = attempts.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and verify the index file at `path` without opening it for use.
    ///
    /// Unlike [`SimilarityIndex::load`] this never moves a bad file aside:
    /// corrupt files are an error and a missing file is `None`.
    pub fn inspect(path: &Path) -> Result<Option<IndexInfo>, IndexError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(IndexError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let (dimension, data) = parse_index(&bytes)?;
        Ok(Some(IndexInfo {
            dimension,
            slots: data.len() / dimension,
        }))
    }

    fn persist(&self, bytes: &[u8]) -> Result<(), IndexError> {
        let mut last_err = None;
        for attempt in 1..=self.persist_attempts {
            match write_atomic(&self.path, bytes) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        attempt,
                        max_attempts = self.persist_attempts,
                        error = %err,
                        "index write failed"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(IndexError::Persist {
            path: self.path.clone(),
            attempts: self.persist_attempts,
            source: last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no write attempted")),
        })
    }
}

impl VectorIndex for SimilarityIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        // Rows are only ever appended whole, so a poisoned lock still guards
        // a consistent array.
        let slots = self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.len() / self.dimension
    }

    fn add(&self, embeddings: &[Embedding]) -> Result<Vec<SlotId>, IndexError> {
        if let Some(bad) = embeddings.iter().find(|e| e.dimension() != self.dimension) {
            return Err(IndexError::Dimension {
                expected: self.dimension,
                actual: bad.dimension(),
            });
        }
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }

        let _writer = self.writer.lock().map_err(|_| IndexError::LockPoisoned)?;

        // Persist the would-be state first; memory only changes once the file
        // holds it, so a failed write leaves both sides identical.
        let (start, bytes) = {
            let slots = self.slots.read().map_err(|_| IndexError::LockPoisoned)?;
            let start = slots.len() / self.dimension;
            (start, encode_index(self.dimension, &slots, embeddings))
        };
        self.persist(&bytes)?;

        {
            let mut slots = self.slots.write().map_err(|_| IndexError::LockPoisoned)?;
            for embedding in embeddings {
                slots.extend_from_slice(&embedding.values);
            }
        }

        let ids: Vec<SlotId> = (start..start + embeddings.len()).map(|i| i as SlotId).collect();
        tracing::debug!(
            first_slot = start,
            count = ids.len(),
            total = start + ids.len(),
            "appended embeddings to similarity index"
        );
        Ok(ids)
    }

    fn search(&self, query: &Embedding, k: usize, threshold: f32) -> Result<Vec<SearchHit>, IndexError> {
        if query.dimension() != self.dimension {
            return Err(IndexError::Dimension {
                expected: self.dimension,
                actual: query.dimension(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let slots = self.slots.read().map_err(|_| IndexError::LockPoisoned)?;

        // NaN distances fail the comparison and never pass the threshold.
        let mut hits: Vec<SearchHit> = slots
            .chunks_exact(self.dimension)
            .enumerate()
            .filter_map(|(slot, row)| {
                let distance = squared_l2(row, &query.values);
                (distance < threshold).then_some(SearchHit {
                    slot_id: slot as SlotId,
                    distance,
                })
            })
            .collect();
        drop(slots);

        // Stable sort over a slot-ordered scan: ties keep the lower slot first.
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Serialize the existing rows plus `extra` into the on-disk format.
fn encode_index(dimension: usize, existing: &[f32], extra: &[Embedding]) -> Vec<u8> {
    let count = existing.len() / dimension + extra.len();
    let payload_floats = existing.len() + extra.len() * dimension;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload_floats * 4 + DIGEST_LEN);

    bytes.extend_from_slice(INDEX_MAGIC);
    bytes.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(dimension as u32).to_le_bytes());
    bytes.extend_from_slice(&(count as u64).to_le_bytes());
    for &value in existing.iter().chain(extra.iter().flat_map(|e| e.values.iter())) {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    let digest = Sha256::digest(&bytes);
    bytes.extend_from_slice(&digest);
    bytes
}

/// Parse and verify an index file, returning its row-major payload.
fn decode_index(bytes: &[u8], expected_dimension: usize) -> Result<Vec<f32>, IndexError> {
    let (dimension, data) = parse_index(bytes)?;
    if dimension != expected_dimension {
        return Err(IndexError::Dimension {
            expected: expected_dimension,
            actual: dimension,
        });
    }
    Ok(data)
}

/// Parse and verify an index file of any dimension.
fn parse_index(bytes: &[u8]) -> Result<(usize, Vec<f32>), IndexError> {
    if bytes.len() < HEADER_LEN + DIGEST_LEN {
        return Err(IndexError::Corrupt(format!("file too short ({} bytes)", bytes.len())));
    }

    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if Sha256::digest(body).as_slice() != digest {
        return Err(IndexError::Corrupt("checksum mismatch".into()));
    }

    if &body[0..4] != INDEX_MAGIC {
        return Err(IndexError::Corrupt("bad magic".into()));
    }
    let version = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    if version != INDEX_FORMAT_VERSION {
        return Err(IndexError::Corrupt(format!("unsupported format version {version}")));
    }
    let dimension = u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;
    if dimension == 0 {
        return Err(IndexError::Corrupt("zero dimension".into()));
    }
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&body[12..20]);
    let count = u64::from_le_bytes(count_bytes) as usize;

    let payload = &body[HEADER_LEN..];
    let expected_len = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| IndexError::Corrupt("slot count overflow".into()))?;
    if payload.len() != expected_len {
        return Err(IndexError::Corrupt(format!(
            "payload length {} does not match {count} slots of dimension {dimension}",
            payload.len()
        )));
    }

    let data = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((dimension, data))
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)
}

/// Move an unusable index file out of the way. Returns where it went.
fn quarantine(path: &Path) -> Option<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
    let target = PathBuf::from(name);

    match fs::rename(path, &target) {
        Ok(()) => Some(target),
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "failed to move corrupt index aside");
            None
        }
    }
}
