//! Item and document records.
//!
//! Items are the retrievable units: standalone notes or chunks of an
//! indexed document. Documents own their chunks; deleting a document
//! removes every chunk item it owns.

mod backend_csv;

pub use backend_csv::CsvRecordStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form string metadata attached to items.
pub type Metadata = BTreeMap<String, String>;

/// Position of a chunk inside its source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub document_id: u64,
    /// 0-based, contiguous within a document
    pub chunk_index: usize,
    /// Byte offset into the extracted document text
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub text: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// Present when the item is a document chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkSpan>,
}

impl Item {
    pub fn is_chunk(&self) -> bool {
        self.chunk.is_some()
    }

    pub fn document_id(&self) -> Option<u64> {
        self.chunk.map(|span| span.document_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub text: String,
    pub metadata: Metadata,
}

impl NewItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Chunk to be stored together with its document.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub metadata: Metadata,
    pub chunk_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

/// Descriptive metadata reported by the document extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    pub page_count: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    pub title: String,
    /// Chunk item ids in chunk order
    pub chunk_ids: Vec<u64>,
    pub source: SourceMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub title: String,
    pub source: SourceMetadata,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("item {0} not found")]
    ItemNotFound(u64),

    #[error("document {0} not found")]
    DocumentNotFound(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: u64, reason: String },

    #[error("record store lock poisoned")]
    Poisoned,
}

/// Keyed storage for items and documents.
///
/// Implementations must apply each mutation atomically: a reader never
/// observes a document whose chunks are only partially stored.
pub trait RecordStore: Send + Sync {
    fn insert_item(&self, item: NewItem) -> Result<Item, RecordError>;
    fn item(&self, id: u64) -> Result<Option<Item>, RecordError>;
    fn items(&self) -> Result<Vec<Item>, RecordError>;
    /// Returns `false` when no item had this id.
    fn delete_item(&self, id: u64) -> Result<bool, RecordError>;

    /// Stores a document together with all of its chunks.
    fn insert_document(
        &self,
        document: NewDocument,
        chunks: Vec<NewChunk>,
    ) -> Result<(Document, Vec<Item>), RecordError>;
    fn document(&self, id: u64) -> Result<Option<Document>, RecordError>;
    fn documents(&self) -> Result<Vec<Document>, RecordError>;
    /// Removes the document and its chunks, returning the removed chunk ids.
    fn delete_document(&self, id: u64) -> Result<Vec<u64>, RecordError>;
}
