//! fastembed-backed [`InferenceModel`].
//!
//! Two ways to load a model:
//! - a built-in fastembed model by name, downloaded once into a cache dir
//! - a local asset directory (ONNX weights + tokenizer files), fully offline
//!
//! Local assets are sanity-checked for presence and minimum size before
//! anything is handed to the runtime, so a missing or truncated download
//! produces a precise diagnostic instead of an opaque ONNX error.

use std::path::{Path, PathBuf};

use fastembed::{
    InitOptions, InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use sha2::{Digest, Sha256};

use crate::semantic::embeddings::{AssetProblem, EmbeddingError, InferenceModel};

/// Smallest plausible ONNX export of a sentence embedding model.
const MIN_ONNX_BYTES: u64 = 1024 * 1024;
const MIN_TOKENIZER_BYTES: u64 = 1024;
/// `{}` is the smallest valid JSON document.
const MIN_JSON_BYTES: u64 = 2;

/// Files expected in a local model directory.
#[derive(Debug, Clone)]
pub struct ModelAssets {
    pub dir: PathBuf,
    pub onnx: PathBuf,
    pub tokenizer: PathBuf,
    pub config: PathBuf,
    pub special_tokens_map: PathBuf,
    pub tokenizer_config: PathBuf,
}

impl ModelAssets {
    pub fn locate(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            onnx: dir.join("model.onnx"),
            tokenizer: dir.join("tokenizer.json"),
            config: dir.join("config.json"),
            special_tokens_map: dir.join("special_tokens_map.json"),
            tokenizer_config: dir.join("tokenizer_config.json"),
        }
    }

    /// Check every file exists and is at least its minimum size.
    pub fn validate(&self) -> Result<(), EmbeddingError> {
        let checks = [
            (&self.onnx, MIN_ONNX_BYTES),
            (&self.tokenizer, MIN_TOKENIZER_BYTES),
            (&self.config, MIN_JSON_BYTES),
            (&self.special_tokens_map, MIN_JSON_BYTES),
            (&self.tokenizer_config, MIN_JSON_BYTES),
        ];

        for (path, minimum) in checks {
            let actual = match std::fs::metadata(path) {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => {
                    return Err(EmbeddingError::InvalidModelAsset {
                        path: path.clone(),
                        problem: AssetProblem::Missing,
                    })
                }
            };
            if actual < minimum {
                return Err(EmbeddingError::InvalidModelAsset {
                    path: path.clone(),
                    problem: AssetProblem::TooSmall { actual, minimum },
                });
            }
        }

        Ok(())
    }
}

/// Wrapper around fastembed's TextEmbedding model.
pub struct FastEmbedModel {
    model: TextEmbedding,
    version: String,
    dimensions: usize,
}

impl FastEmbedModel {
    /// Load a built-in fastembed model, downloading it into `cache_dir`
    /// on first use.
    pub fn builtin(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
        let dimensions = Self::detect_dimensions(&mut model)?;

        Ok(Self {
            model,
            version: model_name.to_lowercase(),
            dimensions,
        })
    }

    /// Load a model from a local asset directory without network access.
    pub fn from_dir(dir: &Path) -> Result<Self, EmbeddingError> {
        let assets = ModelAssets::locate(dir);
        assets.validate()?;

        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to read {}: {}", path.display(), e))
            })
        };

        let onnx = read(&assets.onnx)?;
        let fingerprint = Self::fingerprint(&onnx);
        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read(&assets.tokenizer)?,
            config_file: read(&assets.config)?,
            special_tokens_map_file: read(&assets.special_tokens_map)?,
            tokenizer_config_file: read(&assets.tokenizer_config)?,
        };

        let user_model = UserDefinedEmbeddingModel::new(onnx, tokenizer_files);
        let mut model =
            TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
        let dimensions = Self::detect_dimensions(&mut model)?;

        let dir_name = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        Ok(Self {
            model,
            version: format!("local:{dir_name}@{fingerprint}"),
            dimensions,
        })
    }

    /// Short content hash of the weights, so a swapped model file shows up
    /// as a new model version.
    fn fingerprint(onnx: &[u8]) -> String {
        let digest = Sha256::digest(onnx);
        digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-large-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGELargeENV15Q),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1.5 (add -q suffix for quantized bge/MiniLM)",
                name
            ))),
        }
    }

    /// Run one inference to determine embedding dimensions.
    fn detect_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to detect dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl InferenceModel for FastEmbedModel {
    fn version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn infer(&mut self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        let embeddings = self
            .model
            .embed(vec![prompt], None)
            .map_err(|e| EmbeddingError::GenerationFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::GenerationFailed("No embedding returned".to_string()))
    }
}
