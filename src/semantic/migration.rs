//! Embedding schema migration.
//!
//! The corpus is Consistent when every item has an embedding produced by
//! the active model at the active dimension, and Stale otherwise. A
//! regeneration pass re-embeds every item and upserts the result; per-item
//! failures are counted, never fatal.
//!
//! There is no checkpointing. An interrupted pass leaves a mixed corpus,
//! which the next status check reports as Stale, and rerunning the pass
//! settles it because upserts are idempotent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::audit::{AuditEvent, AuditSink, LogAuditSink};
use crate::config::MigrationConfig;
use crate::records::{Item, RecordError, RecordStore};
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::index::{Embedding, VectorError, VectorStore};
use crate::semantic::service::CORPUS_INTENT;
use crate::semantic::storage::{StorageError, VectorStorage};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("A migration pass is already running")]
    AlreadyRunning,

    #[error("{failed} of {total} items failed to re-embed")]
    PartialMigrationFailure { failed: usize, total: usize },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Snapshot of corpus health against the active model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub total_items: usize,
    /// Items with no embedding
    pub missing: usize,
    /// Items whose embedding has another model version or dimension
    pub stale: usize,
    /// Embeddings whose item no longer exists
    pub orphaned: usize,
}

impl MigrationStatus {
    /// Orphans do not make the corpus stale; search skips them.
    pub fn is_consistent(&self) -> bool {
        self.missing == 0 && self.stale == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items that needed a second attempt, whatever its outcome
    pub retried: usize,
    pub pruned: usize,
    pub failed_ids: Vec<u64>,
}

impl MigrationReport {
    /// `Err(PartialMigrationFailure)` when any item failed.
    pub fn into_result(self) -> Result<Self, MigrationError> {
        if self.failed > 0 {
            return Err(MigrationError::PartialMigrationFailure {
                failed: self.failed,
                total: self.total,
            });
        }
        Ok(self)
    }
}

/// Clears the running flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, MigrationError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MigrationError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Detects and repairs embeddings that do not match the active model.
///
/// A second pass started while one is running fails with
/// [`MigrationError::AlreadyRunning`]. Managers built by
/// [`crate::semantic::RetrievalService::migration_manager`] share one
/// running flag; a manager built with [`MigrationManager::new`] has its own.
pub struct MigrationManager {
    embedder: Arc<Embedder>,
    records: Arc<dyn RecordStore>,
    vectors: Arc<VectorStore>,
    storage: Option<Arc<VectorStorage>>,
    audit: Arc<dyn AuditSink>,
    config: MigrationConfig,
    running: Arc<AtomicBool>,
}

impl MigrationManager {
    pub fn new(
        embedder: Arc<Embedder>,
        records: Arc<dyn RecordStore>,
        vectors: Arc<VectorStore>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            embedder,
            records,
            vectors,
            storage: None,
            audit: Arc::new(LogAuditSink),
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_storage(mut self, storage: Option<Arc<VectorStorage>>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Use `running` as the single-flight flag, shared with other managers
    /// of the same corpus.
    pub(crate) fn with_running_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let info = self.embedder.info()?;
        let items = self.records.items()?;
        let embeddings = self.vectors.get_all()?;

        let by_owner: BTreeMap<u64, &Embedding> = embeddings
            .iter()
            .map(|embedding| (embedding.owner_id, embedding))
            .collect();

        let mut status = MigrationStatus {
            total_items: items.len(),
            ..Default::default()
        };
        for item in &items {
            match by_owner.get(&item.id) {
                None => status.missing += 1,
                Some(embedding) if !embedding.matches(&info.version, info.dimensions) => {
                    status.stale += 1
                }
                Some(_) => {}
            }
        }

        let item_ids: BTreeSet<u64> = items.iter().map(|item| item.id).collect();
        status.orphaned = embeddings
            .iter()
            .filter(|embedding| !item_ids.contains(&embedding.owner_id))
            .count();

        Ok(status)
    }

    /// Whether any item lacks an embedding or has one from another model
    /// or dimension.
    pub fn needs_migration(&self) -> Result<bool, MigrationError> {
        Ok(!self.status()?.is_consistent())
    }

    pub async fn regenerate_all(&self) -> Result<MigrationReport, MigrationError> {
        self.regenerate_all_with(|_, _| {}).await
    }

    /// Re-embed every item under the corpus intent and prune orphaned
    /// embeddings. `progress(done, total)` runs after each item.
    ///
    /// Only setup and persistence errors are returned as `Err`; per-item
    /// failures are counted in the report.
    pub async fn regenerate_all_with(
        &self,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<MigrationReport, MigrationError> {
        let _guard = PassGuard::acquire(&self.running)?;

        let info = self.embedder.info()?;
        let items = self.records.items()?;
        let now = Instant::now();

        log::info!(
            "Regenerating embeddings for {} items with model {} ({} dimensions)",
            items.len(),
            info.version,
            info.dimensions
        );

        let mut report = MigrationReport {
            total: items.len(),
            ..Default::default()
        };

        for (done, item) in items.iter().enumerate() {
            let (result, retried) = self.embed_item(item).await;
            if retried {
                report.retried += 1;
            }

            match result {
                Ok(vector) => {
                    self.vectors.upsert(
                        item.id,
                        Embedding::new(item.id, vector, info.version.as_str()),
                    )?;
                    report.succeeded += 1;
                }
                Err(err) => {
                    log::warn!("Failed to re-embed item {}: {}", item.id, err);
                    report.failed += 1;
                    report.failed_ids.push(item.id);
                }
            }

            progress(done + 1, items.len());
        }

        report.pruned = self.prune_orphans()?;

        if let Some(storage) = &self.storage {
            storage.save_store(&self.vectors)?;
        }

        log::info!(
            "Migration finished in {}ms: {} succeeded, {} failed, {} retried, {} orphans pruned",
            now.elapsed().as_millis(),
            report.succeeded,
            report.failed,
            report.retried,
            report.pruned
        );
        self.audit.record(AuditEvent::MigrationFinished {
            total: report.total,
            succeeded: report.succeeded,
            failed: report.failed,
            pruned: report.pruned,
        });

        Ok(report)
    }

    /// Embed one item, retrying once when configured. The flag tells
    /// whether a retry happened.
    async fn embed_item(&self, item: &Item) -> (Result<Vec<f32>, EmbeddingError>, bool) {
        match self.embedder.embed(&item.text, CORPUS_INTENT).await {
            Ok(vector) => (Ok(vector), false),
            Err(err @ (EmbeddingError::NotInitialized | EmbeddingError::Closed)) => {
                (Err(err), false)
            }
            Err(err) if self.config.retry_failed_once => {
                log::debug!("Retrying item {} after: {}", item.id, err);
                (self.embedder.embed(&item.text, CORPUS_INTENT).await, true)
            }
            Err(err) => (Err(err), false),
        }
    }

    /// Remove embeddings whose item is gone.
    ///
    /// Embeddings are read before items: an item is always stored before
    /// its embedding, so a live item is never mistaken for an orphan.
    fn prune_orphans(&self) -> Result<usize, MigrationError> {
        let embeddings = self.vectors.get_all()?;
        let live: BTreeSet<u64> = self.records.items()?.iter().map(|item| item.id).collect();

        let mut pruned = 0;
        for embedding in embeddings {
            if !live.contains(&embedding.owner_id) {
                self.vectors.delete_by_owner(embedding.owner_id)?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            log::info!("Pruned {pruned} orphaned embeddings");
        }
        Ok(pruned)
    }
}
