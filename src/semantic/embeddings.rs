//! Embedding generation.
//!
//! [`Embedder`] is the service object the rest of the crate talks to:
//! - explicit lifecycle: `initialize` → `embed`* → `close`
//! - intent is a required argument, applied as a prompt template
//! - at most one inference in flight; callers queue on an async mutex
//! - every returned vector is L2-normalized, degenerate output is an error
//!
//! The neural network itself sits behind [`InferenceModel`].

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::EmbedderConfig;
use crate::semantic::intent::Intent;
use crate::semantic::model::FastEmbedModel;

/// Output dimensions an embedder may be configured to produce.
pub const SUPPORTED_DIMENSIONS: [usize; 6] = [128, 256, 384, 512, 768, 1024];

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedder is not initialized; call initialize() before embedding")]
    NotInitialized,

    #[error("Embedder is already initialized")]
    AlreadyInitialized,

    #[error("Embedder has been closed")]
    Closed,

    #[error("Model asset {} {problem}; provision the model files and restart", path.display())]
    InvalidModelAsset { path: PathBuf, problem: AssetProblem },

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizationFailure(String),

    #[error("Embedding generation failed: {0}")]
    GenerationFailed(String),

    #[error("Model produced a degenerate vector ({0})")]
    DegenerateVector(&'static str),

    #[error("Model produced {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Unsupported embedding dimension {0} (supported: 128, 256, 384, 512, 768, 1024)")]
    UnsupportedDimension(usize),

    #[error("Cannot truncate a {from}-dimensional vector to {to} dimensions")]
    InvalidTruncation { from: usize, to: usize },

    #[error("Inference did not finish within {0:?}")]
    Timeout(Duration),
}

/// What is wrong with a model asset file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetProblem {
    Missing,
    TooSmall { actual: u64, minimum: u64 },
}

impl fmt::Display for AssetProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetProblem::Missing => f.write_str("is missing"),
            AssetProblem::TooSmall { actual, minimum } => write!(
                f,
                "is too small ({actual} bytes, expected at least {minimum} bytes)"
            ),
        }
    }
}

/// The opaque model that turns a prompt into a raw vector.
///
/// Inference is blocking and not reentrant, hence `&mut self`.
pub trait InferenceModel: Send {
    /// Tag identifying the weights that produced a vector.
    fn version(&self) -> &str;

    /// Length of the vectors returned by [`InferenceModel::infer`].
    fn dimensions(&self) -> usize;

    fn infer(&mut self, prompt: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Identity of the active embedder; stored next to every embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub version: String,
    pub dimensions: usize,
}

enum Lifecycle {
    Uninitialized,
    Ready(ModelInfo),
    Closed,
}

struct LoadedModel {
    model: Box<dyn InferenceModel>,
    output_dimensions: usize,
}

impl LoadedModel {
    fn embed(&mut self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        let native = self.model.dimensions();
        let raw = self.model.infer(prompt)?;

        if raw.len() != native {
            return Err(EmbeddingError::DimensionMismatch {
                expected: native,
                got: raw.len(),
            });
        }
        if raw.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::DegenerateVector("non-finite component"));
        }

        if self.output_dimensions < native {
            truncate(&raw, self.output_dimensions)
        } else {
            normalize(raw)
        }
    }
}

/// Shared embedding service. Construct once, pass by reference.
pub struct Embedder {
    model: Arc<Mutex<Option<LoadedModel>>>,
    lifecycle: RwLock<Lifecycle>,
    timeout: Option<Duration>,
}

impl Default for Embedder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Embedder {
    /// Create an uninitialized embedder.
    ///
    /// `timeout` bounds each inference call. The blocking inference thread
    /// cannot be interrupted, so after a timeout the model stays locked
    /// until that call returns.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            timeout,
        }
    }

    /// Load the configured fastembed model and make it active.
    ///
    /// Blocking: may read hundreds of megabytes and, for built-in models
    /// that are not cached yet, download them.
    pub fn initialize(
        &self,
        config: &EmbedderConfig,
        base_path: &std::path::Path,
    ) -> Result<ModelInfo, EmbeddingError> {
        self.ensure_uninitialized()?;

        let model = match &config.model_dir {
            Some(dir) => FastEmbedModel::from_dir(dir)?,
            None => {
                let cache_dir = config
                    .cache_dir
                    .clone()
                    .unwrap_or_else(|| base_path.join("models"));
                FastEmbedModel::builtin(&config.model, cache_dir)?
            }
        };

        self.initialize_with(Box::new(model), config.output_dimensions)
    }

    /// Make `model` the active model.
    ///
    /// `output_dimensions` selects a Matryoshka prefix of the model's
    /// vectors; `None` keeps the native size.
    pub fn initialize_with(
        &self,
        model: Box<dyn InferenceModel>,
        output_dimensions: Option<usize>,
    ) -> Result<ModelInfo, EmbeddingError> {
        self.ensure_uninitialized()?;

        let native = model.dimensions();
        let output = output_dimensions.unwrap_or(native);
        if output == 0 || output > native {
            return Err(EmbeddingError::InvalidTruncation {
                from: native,
                to: output,
            });
        }
        if !SUPPORTED_DIMENSIONS.contains(&output) {
            return Err(EmbeddingError::UnsupportedDimension(output));
        }

        let version = if output < native {
            format!("{}#{}", model.version(), output)
        } else {
            model.version().to_string()
        };
        let info = ModelInfo {
            version,
            dimensions: output,
        };

        // nothing can hold the lock before the lifecycle says Ready
        let mut slot = self
            .model
            .try_lock()
            .map_err(|_| EmbeddingError::AlreadyInitialized)?;
        *slot = Some(LoadedModel {
            model,
            output_dimensions: output,
        });
        drop(slot);

        let mut lifecycle = self.lifecycle.write().unwrap_or_else(|e| e.into_inner());
        *lifecycle = Lifecycle::Ready(info.clone());

        log::info!(
            "Embedder ready: model={} dimensions={}",
            info.version,
            info.dimensions
        );
        Ok(info)
    }

    /// Identity of the active model.
    pub fn info(&self) -> Result<ModelInfo, EmbeddingError> {
        let lifecycle = self.lifecycle.read().unwrap_or_else(|e| e.into_inner());
        match &*lifecycle {
            Lifecycle::Ready(info) => Ok(info.clone()),
            Lifecycle::Uninitialized => Err(EmbeddingError::NotInitialized),
            Lifecycle::Closed => Err(EmbeddingError::Closed),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.info().is_ok()
    }

    /// Embed `text` under `intent`.
    ///
    /// Calls are serialized: if another embedding is running this waits for
    /// it to finish. The result is unit length and `info().dimensions` long.
    pub async fn embed(&self, text: &str, intent: Intent) -> Result<Vec<f32>, EmbeddingError> {
        self.info()?;

        if text.trim().is_empty() {
            return Err(EmbeddingError::TokenizationFailure(
                "input text is empty".to_string(),
            ));
        }
        let prompt = intent.apply(text);

        let mut slot = self.model.clone().lock_owned().await;
        let task = tokio::task::spawn_blocking(move || match &mut *slot {
            Some(loaded) => loaded.embed(&prompt),
            None => Err(EmbeddingError::Closed),
        });

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| EmbeddingError::Timeout(limit))?,
            None => task.await,
        };

        joined.map_err(|e| EmbeddingError::GenerationFailed(format!("inference task failed: {e}")))?
    }

    /// Release the model. Waits for an in-flight embedding to finish.
    pub async fn close(&self) {
        let mut slot = self.model.lock().await;
        let released = slot.take().is_some();
        drop(slot);

        let mut lifecycle = self.lifecycle.write().unwrap_or_else(|e| e.into_inner());
        *lifecycle = Lifecycle::Closed;

        if released {
            log::info!("Embedder closed");
        }
    }

    fn ensure_uninitialized(&self) -> Result<(), EmbeddingError> {
        let lifecycle = self.lifecycle.read().unwrap_or_else(|e| e.into_inner());
        match &*lifecycle {
            Lifecycle::Uninitialized => Ok(()),
            Lifecycle::Ready(_) => Err(EmbeddingError::AlreadyInitialized),
            Lifecycle::Closed => Err(EmbeddingError::Closed),
        }
    }
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length. Zero vectors are rejected, not passed through.
pub fn normalize(mut v: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
    let norm = l2_norm(&v);
    if !norm.is_finite() || norm < f32::EPSILON {
        return Err(EmbeddingError::DegenerateVector("zero norm"));
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(v)
}

/// Matryoshka truncation: keep the first `target` components and
/// re-normalize.
pub fn truncate(vector: &[f32], target: usize) -> Result<Vec<f32>, EmbeddingError> {
    if target == 0 || target > vector.len() {
        return Err(EmbeddingError::InvalidTruncation {
            from: vector.len(),
            to: target,
        });
    }
    normalize(vector[..target].to_vec())
}
