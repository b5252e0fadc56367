use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Service configuration: an optional TOML file overlaid by `FINDME_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root for everything the service writes when no explicit path is set.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files (default: `<data_dir>/models`).
    pub model_dir: Option<PathBuf>,
    /// Similarity index file (default: `<data_dir>/faces.index`).
    pub index_path: Option<PathBuf>,
    /// SQLite catalog (default: `<data_dir>/catalog.db`).
    pub catalog_path: Option<PathBuf>,
    /// Blob root (default: `<data_dir>/blobs`).
    pub blob_dir: Option<PathBuf>,
    /// Public URL prefix the blob root is served under.
    pub blob_base_url: Option<String>,
    pub embedding_dim: usize,
    /// Squared L2 distance below which a face counts as a match.
    pub match_threshold: f32,
    pub match_limit: usize,
    /// L2-normalize embeddings before they reach the index. The match
    /// threshold must be calibrated for whichever setting is used.
    pub l2_normalize: bool,
    pub persist_attempts: u32,
    /// Longest side of rendered watermark images, in pixels.
    pub watermark_max_side: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: findme_core::default_data_dir(),
            model_dir: None,
            index_path: None,
            catalog_path: None,
            blob_dir: None,
            blob_base_url: None,
            embedding_dim: 512,
            match_threshold: 0.8,
            match_limit: 10,
            l2_normalize: false,
            persist_attempts: 3,
            watermark_max_side: 1024,
        }
    }
}

impl Config {
    /// Load from `$FINDME_CONFIG` (if set), then apply `FINDME_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FINDME_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `FINDME_*` variables as resolved by `lookup`.
    /// Values that fail to parse keep the current setting.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FINDME_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FINDME_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FINDME_INDEX_PATH") {
            self.index_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FINDME_CATALOG_PATH") {
            self.catalog_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FINDME_BLOB_DIR") {
            self.blob_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FINDME_BLOB_BASE_URL") {
            self.blob_base_url = Some(v);
        }

        env_parsed(&lookup, "FINDME_EMBEDDING_DIM", &mut self.embedding_dim);
        env_parsed(&lookup, "FINDME_MATCH_THRESHOLD", &mut self.match_threshold);
        env_parsed(&lookup, "FINDME_MATCH_LIMIT", &mut self.match_limit);
        env_parsed(&lookup, "FINDME_PERSIST_ATTEMPTS", &mut self.persist_attempts);
        env_parsed(&lookup, "FINDME_WATERMARK_MAX_SIDE", &mut self.watermark_max_side);

        if let Some(v) = lookup("FINDME_L2_NORMALIZE") {
            self.l2_normalize = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be positive".into()));
        }
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a positive number, got {}",
                self.match_threshold
            )));
        }
        if self.match_limit == 0 {
            return Err(ConfigError::Invalid("match_limit must be positive".into()));
        }
        if self.persist_attempts == 0 {
            return Err(ConfigError::Invalid("persist_attempts must be at least 1".into()));
        }
        if self.watermark_max_side == 0 {
            return Err(ConfigError::Invalid("watermark_max_side must be positive".into()));
        }
        Ok(())
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path.clone().unwrap_or_else(|| self.data_dir.join("faces.index"))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path.clone().unwrap_or_else(|| self.data_dir.join("catalog.db"))
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.blob_dir.clone().unwrap_or_else(|| self.data_dir.join("blobs"))
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir()
            .join(findme_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir()
            .join(findme_core::EMBEDDER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn env_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(v) => *field = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config override"),
        }
    }
}
