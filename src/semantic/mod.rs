//! Offline semantic retrieval.
//!
//! # Architecture
//!
//! - `chunker`: Splits long text into overlapping, sentence-aligned chunks
//! - `intent`: Prompt templates selecting the embedding space
//! - `embeddings`: Embedder service (lifecycle, serialization, normalization)
//! - `model`: fastembed-backed inference, built-in or local assets
//! - `index`: In-memory vector store with cosine similarity search
//! - `storage`: Binary vectors.bin persistence and CSV export
//! - `service`: Retrieval coordinator (insert, search, index documents)
//! - `migration`: Detects and regenerates stale embeddings

pub mod chunker;
pub mod embeddings;
pub mod index;
pub mod intent;
pub mod migration;
pub mod model;
pub mod service;
pub mod storage;

pub use chunker::{Chunker, TextChunk};
pub use embeddings::{Embedder, EmbeddingError, InferenceModel, ModelInfo};
pub use index::{cosine_similarity, Embedding, ScoredOwner, VectorError, VectorStore};
pub use intent::Intent;
pub use migration::{MigrationError, MigrationManager, MigrationReport, MigrationStatus};
pub use service::{
    IndexReport, RetrievalService, SearchHit, Stats, CORPUS_INTENT, QUERY_INTENT,
};
pub use storage::{parse_vector, serialize_vector, StorageError, VectorStorage};
