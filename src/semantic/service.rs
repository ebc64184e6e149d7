//! Retrieval service.
//!
//! Coordinates the embedder, the vector store and the record store:
//! - insert: embed under [`CORPUS_INTENT`], store item, upsert embedding
//! - search: embed under [`QUERY_INTENT`], rank every stored embedding,
//!   map owners back to items
//! - index_document: extract, chunk, embed each chunk, store document

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::Serialize;

use crate::audit::{AuditEvent, AuditSink, JsonlAuditSink, LogAuditSink};
use crate::config::{ChunkerConfig, Config, MigrationConfig, SearchConfig};
use crate::error::{RecallError, Result};
use crate::ingest::{DocumentExtractor, PlainTextExtractor};
use crate::records::{
    CsvRecordStore, Document, Item, Metadata, NewChunk, NewDocument, NewItem, RecordStore,
    SourceMetadata,
};
use crate::semantic::chunker::Chunker;
use crate::semantic::embeddings::Embedder;
use crate::semantic::index::{self, Embedding, VectorStore};
use crate::semantic::intent::Intent;
use crate::semantic::migration::MigrationManager;
use crate::semantic::storage::{self, StorageError, VectorStorage};

/// Intent every corpus item is embedded under.
pub const CORPUS_INTENT: Intent = Intent::Document;

/// Intent queries are embedded under.
///
/// Vectors from different intents are not comparable. Switching queries to
/// another intent requires re-embedding the whole corpus under it first.
pub const QUERY_INTENT: Intent = Intent::Document;

const _: () = assert!(
    QUERY_INTENT.same_space(CORPUS_INTENT),
    "queries must be embedded under the corpus intent"
);

const VECTORS_FILE_NAME: &str = "vectors.bin";
const RECORDS_DIR_NAME: &str = "records";

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub item: Item,
    /// Cosine similarity to the query
    pub score: f32,
}

/// Outcome of indexing one document.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub document: Document,
    pub chunks: usize,
    pub embedded: usize,
    /// Chunks stored without an embedding; the next migration fills them in
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub items: usize,
    pub documents: usize,
    pub embeddings: usize,
    pub model_version: Option<String>,
    pub dimensions: Option<usize>,
}

pub struct RetrievalService {
    embedder: Arc<Embedder>,
    records: Arc<dyn RecordStore>,
    vectors: Arc<VectorStore>,
    storage: Option<Arc<VectorStorage>>,
    chunker: Chunker,
    search: SearchConfig,
    extractor: Arc<dyn DocumentExtractor>,
    audit: Arc<dyn AuditSink>,
    /// Shared by every migration manager handed out, so passes over this
    /// corpus are single-flight across managers.
    migration_running: Arc<AtomicBool>,
}

impl RetrievalService {
    /// Assemble a service from its parts. Vectors stay in memory until
    /// [`RetrievalService::with_vector_storage`] is set.
    pub fn new(
        embedder: Arc<Embedder>,
        records: Arc<dyn RecordStore>,
        vectors: Arc<VectorStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            embedder,
            records,
            vectors,
            storage: None,
            chunker: Chunker::default(),
            search: SearchConfig::default(),
            extractor: Arc::new(PlainTextExtractor),
            audit,
            migration_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the on-disk state under the config's base path.
    ///
    /// An unreadable `vectors.bin` (unknown version, bad checksum) is
    /// replaced by an empty store; the migration manager then reports
    /// every item as missing.
    pub fn open(config: &Config, embedder: Arc<Embedder>) -> Result<Self> {
        let base_path = config.base_path();

        let records = CsvRecordStore::open(&base_path.join(RECORDS_DIR_NAME))?;
        let storage = VectorStorage::new(base_path.join(VECTORS_FILE_NAME));
        let vectors = load_vectors(&storage)?;

        let audit: Arc<dyn AuditSink> = match &config.audit_log {
            Some(path) => Arc::new(JsonlAuditSink::open(path).map_err(RecallError::Audit)?),
            None => Arc::new(LogAuditSink),
        };

        Ok(Self::new(embedder, Arc::new(records), Arc::new(vectors), audit)
            .with_chunker(config.chunker.clone())
            .with_search(config.search.clone())
            .with_vector_storage(storage))
    }

    pub fn with_chunker(mut self, config: ChunkerConfig) -> Self {
        self.chunker = Chunker::new(config);
        self
    }

    pub fn with_search(mut self, config: SearchConfig) -> Self {
        self.search = config;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_vector_storage(mut self, storage: VectorStorage) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn vectors(&self) -> &Arc<VectorStore> {
        &self.vectors
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn default_limit(&self) -> usize {
        self.search.default_limit
    }

    /// Migration manager over the same stores. Managers from one service
    /// share a running flag: only one pass runs at a time.
    pub fn migration_manager(&self, config: MigrationConfig) -> MigrationManager {
        MigrationManager::new(
            self.embedder.clone(),
            self.records.clone(),
            self.vectors.clone(),
            config,
        )
        .with_storage(self.storage.clone())
        .with_audit(self.audit.clone())
        .with_running_flag(self.migration_running.clone())
    }

    /// Store a note and its embedding. Returns the new item id.
    ///
    /// The text is embedded before anything is stored. If storing the
    /// embedding or saving fails, the item is removed again, so an `Err`
    /// never leaves the note behind.
    pub async fn insert(&self, text: &str, metadata: Metadata) -> Result<u64> {
        let info = self.embedder.info()?;
        let vector = self.embedder.embed(text, CORPUS_INTENT).await?;

        let item = self
            .records
            .insert_item(NewItem::new(text).with_metadata(metadata))?;
        let stored = self
            .vectors
            .upsert(item.id, Embedding::new(item.id, vector, info.version.as_str()))
            .map_err(RecallError::from)
            .and_then(|_| self.persist());
        if let Err(err) = stored {
            self.discard_items(&[item.id]);
            return Err(err);
        }

        log::debug!("Inserted item {}", item.id);
        self.audit.record(AuditEvent::ItemInserted {
            item_id: item.id,
            model_version: info.version,
        });

        Ok(item.id)
    }

    /// Items most similar to `query`, best first, at most `limit`.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let info = self.embedder.info()?;
        let query_vector = self.embedder.embed(query, QUERY_INTENT).await?;

        let candidates = self.vectors.get_all()?;
        let stale = candidates
            .iter()
            .filter(|embedding| !embedding.matches(&info.version, info.dimensions))
            .count();
        if stale > 0 {
            log::warn!(
                "{stale} of {} embeddings were produced by another model; run a migration",
                candidates.len()
            );
        }

        let ranked = index::search(&query_vector, &candidates, candidates.len());

        let mut hits = Vec::with_capacity(limit.min(ranked.len()));
        for scored in ranked {
            // ranked is descending, nothing after this can qualify
            if hits.len() >= limit {
                break;
            }
            if self.search.min_score.is_some_and(|min| scored.score < min) {
                break;
            }
            match self.records.item(scored.owner_id)? {
                Some(item) => hits.push(SearchHit {
                    item,
                    score: scored.score,
                }),
                None => log::debug!("Skipping orphaned embedding of owner {}", scored.owner_id),
            }
        }

        self.audit.record(AuditEvent::SearchExecuted {
            query_chars: query.chars().count(),
            candidates: candidates.len(),
            results: hits.len(),
        });

        Ok(hits)
    }

    /// Extract, chunk and embed the document at `path`.
    ///
    /// `title` falls back to the extractor's title, then to the path.
    pub async fn index_document(&self, path: &Path, title: Option<&str>) -> Result<IndexReport> {
        let extracted = self.extractor.extract(path)?;

        let title = title
            .map(str::to_string)
            .or_else(|| extracted.metadata.title.clone())
            .unwrap_or_else(|| path.display().to_string());

        let source = SourceMetadata {
            author: extracted.metadata.author,
            subject: extracted.metadata.subject,
            creation_date: extracted.metadata.creation_date,
            page_count: extracted.metadata.page_count,
            size_bytes: extracted.size_bytes,
        };

        self.index_text(&title, &extracted.full_text, source).await
    }

    /// Chunk and embed already extracted text as a document.
    ///
    /// Chunks that fail to embed are still stored and counted in the
    /// report; they do not abort the document. A failure while storing
    /// vectors or saving removes the whole document again.
    pub async fn index_text(
        &self,
        title: &str,
        text: &str,
        source: SourceMetadata,
    ) -> Result<IndexReport> {
        let info = self.embedder.info()?;

        let mut metadata = Metadata::new();
        metadata.insert("document_title".to_string(), title.to_string());
        if let Some(author) = &source.author {
            metadata.insert("author".to_string(), author.clone());
        }

        let chunks = self.chunker.chunk(text, &metadata);
        if chunks.is_empty() {
            log::warn!("Document '{title}' produced no chunks");
        }

        let mut vectors = Vec::with_capacity(chunks.len());
        let mut failed = 0;
        for chunk in &chunks {
            match self.embedder.embed(&chunk.text, CORPUS_INTENT).await {
                Ok(vector) => vectors.push(Some(vector)),
                Err(err) => {
                    log::warn!("Failed to embed chunk {} of '{title}': {err}", chunk.index);
                    failed += 1;
                    vectors.push(None);
                }
            }
        }

        let new_chunks = chunks
            .into_iter()
            .map(|chunk| NewChunk {
                text: chunk.text,
                metadata: chunk.metadata,
                chunk_index: chunk.index,
                start_offset: chunk.start_offset,
                end_offset: chunk.end_offset,
            })
            .collect();
        let (document, items) = self.records.insert_document(
            NewDocument {
                title: title.to_string(),
                source,
            },
            new_chunks,
        )?;

        let embedded = match self.store_chunk_vectors(&items, vectors, &info.version) {
            Ok(embedded) => embedded,
            Err(err) => {
                if let Err(cleanup) = self.records.delete_document(document.id) {
                    log::error!("Failed to remove document {} after error: {cleanup}", document.id);
                }
                let ids: Vec<u64> = items.iter().map(|item| item.id).collect();
                self.discard_items(&ids);
                return Err(err);
            }
        };

        log::info!(
            "Indexed document {} '{}': {} chunks, {} failed",
            document.id,
            document.title,
            items.len(),
            failed
        );
        self.audit.record(AuditEvent::DocumentIndexed {
            document_id: document.id,
            title: document.title.clone(),
            chunks: items.len(),
            failed,
        });

        Ok(IndexReport {
            chunks: items.len(),
            embedded,
            failed,
            document,
        })
    }

    fn store_chunk_vectors(
        &self,
        items: &[Item],
        vectors: Vec<Option<Vec<f32>>>,
        model_version: &str,
    ) -> Result<usize> {
        let mut embedded = 0;
        for (item, vector) in items.iter().zip(vectors) {
            if let Some(vector) = vector {
                self.vectors
                    .upsert(item.id, Embedding::new(item.id, vector, model_version))?;
                embedded += 1;
            }
        }
        self.persist()?;
        Ok(embedded)
    }

    /// Best-effort removal of items stored by an operation that then failed.
    fn discard_items(&self, ids: &[u64]) {
        for id in ids {
            if let Err(err) = self.vectors.delete_by_owner(*id) {
                log::error!("Failed to drop embedding {id} after error: {err}");
            }
            // chunks of a removed document are already gone
            if let Err(err) = self.records.delete_item(*id) {
                log::error!("Failed to remove item {id} after error: {err}");
            }
        }
    }

    /// Delete an item and its embedding. Returns `false` if it did not exist.
    pub fn delete_item(&self, id: u64) -> Result<bool> {
        let removed = self.records.delete_item(id)?;
        if self.vectors.delete_by_owner(id)?.is_some() {
            self.persist()?;
        }

        if removed {
            self.audit.record(AuditEvent::ItemDeleted { item_id: id });
        }
        Ok(removed)
    }

    /// Delete a document, its chunks and their embeddings. Returns the
    /// number of chunks removed.
    pub fn delete_document(&self, id: u64) -> Result<usize> {
        let chunk_ids = self.records.delete_document(id)?;
        for chunk_id in &chunk_ids {
            self.vectors.delete_by_owner(*chunk_id)?;
        }
        self.persist()?;

        self.audit.record(AuditEvent::DocumentDeleted {
            document_id: id,
            chunks: chunk_ids.len(),
        });
        Ok(chunk_ids.len())
    }

    pub fn item(&self, id: u64) -> Result<Option<Item>> {
        Ok(self.records.item(id)?)
    }

    pub fn document(&self, id: u64) -> Result<Option<Document>> {
        Ok(self.records.document(id)?)
    }

    pub fn stats(&self) -> Result<Stats> {
        let info = self.embedder.info().ok();
        Ok(Stats {
            items: self.records.items()?.len(),
            documents: self.records.documents()?.len(),
            embeddings: self.vectors.len(),
            model_version: info.as_ref().map(|info| info.version.clone()),
            dimensions: info.map(|info| info.dimensions),
        })
    }

    /// Write every embedding as CSV. Returns the number of rows.
    pub fn export_vectors<W: std::io::Write>(&self, writer: W) -> Result<usize> {
        let embeddings = self.vectors.get_all()?;
        Ok(storage::export_text(writer, &embeddings)?)
    }

    /// Write the vector store to `vectors.bin`, if one is attached.
    pub fn persist(&self) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.save_store(&self.vectors)?;
        }
        Ok(())
    }
}

fn load_vectors(storage: &VectorStorage) -> Result<VectorStore> {
    if !storage.exists() {
        log::info!("No existing vectors, starting fresh");
        return Ok(VectorStore::new());
    }

    match storage.load() {
        Ok(embeddings) => {
            log::info!("Loaded {} vectors from storage", embeddings.len());
            Ok(VectorStore::from_embeddings(embeddings))
        }
        Err(StorageError::VersionMismatch(file_ver, _)) => {
            log::warn!(
                "Vector storage version {} unsupported, starting fresh",
                file_ver
            );
            Ok(VectorStore::new())
        }
        Err(err @ (StorageError::ChecksumMismatch | StorageError::InvalidFormat(_))) => {
            log::warn!("Vector storage unreadable ({err}), starting fresh");
            Ok(VectorStore::new())
        }
        Err(err) => {
            log::error!("Failed to load vectors: {}", err);
            Err(err.into())
        }
    }
}
