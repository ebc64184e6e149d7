use std::path::{Path, PathBuf};

use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::semantic::embeddings::SUPPORTED_DIMENSIONS;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default embedding model (fastembed built-in)
const DEFAULT_MODEL: &str = "bge-small-en-v1.5";

const DEFAULT_MIN_CHUNK_TOKENS: usize = 100;
const DEFAULT_MAX_CHUNK_TOKENS: usize = 600;
const DEFAULT_OVERLAP_TOKENS: usize = 100;

const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine home directory; set RECALL_BASE_PATH")]
    NoHomeDir,

    #[error("Config I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Embedding model selection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Built-in fastembed model name (e.g., "bge-small-en-v1.5")
    #[serde(default = "default_model")]
    pub model: String,

    /// Local model directory; takes precedence over `model` and never
    /// touches the network
    #[serde(default)]
    pub model_dir: Option<PathBuf>,

    /// Matryoshka output size; native size when unset
    #[serde(default)]
    pub output_dimensions: Option<usize>,

    /// Per-call inference timeout; unbounded when unset
    #[serde(default)]
    pub inference_timeout_secs: Option<u64>,

    /// Download cache for built-in models; `<base>/models` when unset
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            model_dir: None,
            output_dimensions: None,
            inference_timeout_secs: None,
            cache_dir: None,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    #[default]
    Sentence,
    Paragraph,
}

/// Chunk sizing, all in estimated tokens
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default)]
    pub mode: ChunkMode,
    #[serde(default = "default_min_chunk_tokens")]
    pub min_chunk_tokens: usize,
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    /// Keep a final chunk smaller than `min_chunk_tokens` instead of
    /// dropping it
    #[serde(default)]
    pub keep_trailing_fragment: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            mode: ChunkMode::Sentence,
            min_chunk_tokens: DEFAULT_MIN_CHUNK_TOKENS,
            max_chunk_tokens: DEFAULT_MAX_CHUNK_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
            keep_trailing_fragment: false,
        }
    }
}

fn default_min_chunk_tokens() -> usize {
    DEFAULT_MIN_CHUNK_TOKENS
}

fn default_max_chunk_tokens() -> usize {
    DEFAULT_MAX_CHUNK_TOKENS
}

fn default_overlap_tokens() -> usize {
    DEFAULT_OVERLAP_TOKENS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
    /// Results scoring below this are dropped, within [-1.0, 1.0].
    /// Unset means every ranked item is eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_SEARCH_LIMIT,
            min_score: None,
        }
    }
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_true")]
    pub retry_failed_once: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            retry_failed_once: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    /// Append-only JSON lines audit file; audit events go to the log when
    /// unset
    #[serde(default)]
    pub audit_log: Option<PathBuf>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

/// Base directory for all state: `RECALL_BASE_PATH`, else
/// `~/.local/share/recall`.
pub fn base_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var("RECALL_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .ok()
        .flatten()
        .ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".local/share/recall"))
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunker = &self.chunker;
        if chunker.max_chunk_tokens == 0 {
            return Err(ConfigError::Invalid(
                "chunker.max_chunk_tokens must be greater than 0".to_string(),
            ));
        }
        if chunker.min_chunk_tokens > chunker.max_chunk_tokens {
            return Err(ConfigError::Invalid(format!(
                "chunker.min_chunk_tokens ({}) must not exceed chunker.max_chunk_tokens ({})",
                chunker.min_chunk_tokens, chunker.max_chunk_tokens
            )));
        }
        if chunker.overlap_tokens >= chunker.max_chunk_tokens {
            return Err(ConfigError::Invalid(format!(
                "chunker.overlap_tokens ({}) must be less than chunker.max_chunk_tokens ({})",
                chunker.overlap_tokens, chunker.max_chunk_tokens
            )));
        }

        if let Some(dim) = self.embedder.output_dimensions {
            if !SUPPORTED_DIMENSIONS.contains(&dim) {
                return Err(ConfigError::Invalid(format!(
                    "embedder.output_dimensions must be one of {SUPPORTED_DIMENSIONS:?}, got {dim}"
                )));
            }
        }
        if self.embedder.inference_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "embedder.inference_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(min_score) = self.search.min_score {
            if !(-1.0..=1.0).contains(&min_score) {
                return Err(ConfigError::Invalid(format!(
                    "search.min_score must be between -1.0 and 1.0, got {min_score}"
                )));
            }
        }
        if self.search.default_limit == 0 {
            return Err(ConfigError::Invalid(
                "search.default_limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if it
    /// does not exist.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let path = base_path.join(CONFIG_FILE_NAME);
        let io_err = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(base_path).map_err(io_err)?;

        // create new if does not exist
        if !path.exists() {
            let mut config = Self::default();
            config.base_path = base_path.to_path_buf();
            config.save()?;
        }

        let config_str = std::fs::read_to_string(&path).map_err(io_err)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.base_path.join(CONFIG_FILE_NAME);
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&path, config_str).map_err(|source| ConfigError::Io { path, source })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn inference_timeout(&self) -> Option<std::time::Duration> {
        self.embedder
            .inference_timeout_secs
            .map(std::time::Duration::from_secs)
    }
}
