use crate::config::ConfigError;
use crate::ingest::ExtractionError;
use crate::records::RecordError;
use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::index::VectorError;
use crate::semantic::migration::MigrationError;
use crate::semantic::storage::StorageError;

/// Errors surfaced by the retrieval service.
#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audit log error: {0}")]
    Audit(#[source] std::io::Error),
}

pub type Result<T, E = RecallError> = std::result::Result<T, E>;
