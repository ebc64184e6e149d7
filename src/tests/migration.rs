//! Model switches and regeneration passes over a shared corpus.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditEvent;
use crate::config::{ChunkerConfig, MigrationConfig};
use crate::records::Metadata;
use crate::semantic::index::Embedding;
use crate::semantic::migration::MigrationError;
use crate::semantic::service::RetrievalService;
use crate::semantic::storage::VectorStorage;
use crate::tests::support::{
    service_with, switch_model, FailingModel, FlakyModel, SlowModel, VocabularyModel,
};

const NOTES: [&str; 4] = [
    "country roads take me home",
    "home sweet home",
    "quarterly tax filing deadline reminder",
    "sourdough starter feeding schedule",
];

async fn seeded(service: &RetrievalService) -> Vec<u64> {
    let mut ids = Vec::new();
    for note in NOTES {
        ids.push(service.insert(note, Metadata::new()).await.unwrap());
    }
    ids
}

fn retrying() -> MigrationConfig {
    MigrationConfig {
        retry_failed_once: true,
    }
}

#[tokio::test]
async fn test_fresh_corpus_is_consistent() {
    let (service, _) = service_with(VocabularyModel::new(128));
    seeded(&service).await;

    let manager = service.migration_manager(retrying());
    let status = manager.status().unwrap();

    assert_eq!(status.total_items, NOTES.len());
    assert_eq!(status.missing, 0);
    assert_eq!(status.stale, 0);
    assert!(!manager.needs_migration().unwrap());
}

#[tokio::test]
async fn test_model_switch_marks_corpus_stale_until_regenerated() {
    let (service, _) = service_with(VocabularyModel::new(128));
    seeded(&service).await;

    let upgraded = switch_model(&service, VocabularyModel::with_version("vocabulary-v2", 256));
    let manager = upgraded.migration_manager(retrying());

    let status = manager.status().unwrap();
    assert_eq!(status.stale, NOTES.len());
    assert!(manager.needs_migration().unwrap());

    let report = manager.regenerate_all().await.unwrap();
    assert_eq!(report.total, NOTES.len());
    assert_eq!(report.succeeded, NOTES.len());
    assert_eq!(report.failed, 0);
    assert!(!manager.needs_migration().unwrap());

    for embedding in upgraded.vectors().get_all().unwrap() {
        assert!(embedding.matches("vocabulary-v2", 256));
    }

    // searching works again in the new space
    let hits = upgraded.search("home sweet home", 1).await.unwrap();
    assert_eq!(hits[0].item.text, "home sweet home");
}

#[tokio::test]
async fn test_missing_embeddings_are_filled_in() {
    let (service, _) = service_with(FailingModel::new("poison"));
    let service = service.with_chunker(ChunkerConfig {
        keep_trailing_fragment: true,
        ..Default::default()
    });
    let report = service
        .index_text(
            "notes",
            "The poison garden is closed to visitors this season. \
             The herb garden stays open every weekend.",
            Default::default(),
        )
        .await
        .unwrap();
    // a short document is kept as a single chunk
    assert_eq!(report.failed, 1);

    let repaired = switch_model(&service, VocabularyModel::new(128));
    let manager = repaired.migration_manager(retrying());
    assert_eq!(manager.status().unwrap().missing, 1);

    let migration = manager.regenerate_all().await.unwrap();
    assert_eq!(migration.succeeded, 1);
    assert_eq!(manager.status().unwrap().missing, 0);
}

#[tokio::test]
async fn test_item_failure_does_not_abort_the_pass() {
    let (service, _) = service_with(VocabularyModel::new(128));
    let ids = seeded(&service).await;
    let poisoned = service
        .insert("poison apple", Metadata::new())
        .await
        .unwrap();

    let failing = switch_model(&service, FailingModel::new("poison"));
    let report = failing
        .migration_manager(retrying())
        .regenerate_all()
        .await
        .unwrap();

    assert_eq!(report.total, ids.len() + 1);
    assert_eq!(report.succeeded, ids.len());
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_ids, vec![poisoned]);
    // the failing item was retried once and failed again
    assert_eq!(report.retried, 1);

    assert!(matches!(
        report.into_result(),
        Err(MigrationError::PartialMigrationFailure {
            failed: 1,
            total: 5
        })
    ));
}

#[tokio::test]
async fn test_transient_failures_are_retried_once() {
    let (service, _) = service_with(VocabularyModel::new(128));
    seeded(&service).await;

    let flaky = switch_model(&service, FlakyModel::new("flaky-v1"));
    let report = flaky
        .migration_manager(retrying())
        .regenerate_all()
        .await
        .unwrap();
    assert_eq!(report.succeeded, NOTES.len());
    assert_eq!(report.retried, NOTES.len());

    let flaky = switch_model(&service, FlakyModel::new("flaky-v2"));
    let report = flaky
        .migration_manager(MigrationConfig {
            retry_failed_once: false,
        })
        .regenerate_all()
        .await
        .unwrap();
    assert_eq!(report.failed, NOTES.len());
    assert_eq!(report.retried, 0);
}

#[tokio::test]
async fn test_orphans_are_reported_and_pruned() {
    let (service, audit) = service_with(VocabularyModel::new(128));
    seeded(&service).await;
    service
        .vectors()
        .upsert(999, Embedding::new(999, vec![1.0; 128], "vocabulary-v1"))
        .unwrap();

    let manager = service.migration_manager(retrying());
    let status = manager.status().unwrap();
    assert_eq!(status.orphaned, 1);
    // orphans alone do not require a migration
    assert!(status.is_consistent());

    let report = manager.regenerate_all().await.unwrap();
    assert_eq!(report.pruned, 1);
    assert!(!service.vectors().contains(999).unwrap());
    assert_eq!(manager.status().unwrap().orphaned, 0);

    assert!(audit.events().iter().any(|event| matches!(
        event,
        AuditEvent::MigrationFinished { pruned: 1, .. }
    )));
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let (service, _) = service_with(VocabularyModel::new(128));
    seeded(&service).await;
    let upgraded = switch_model(&service, VocabularyModel::with_version("vocabulary-v2", 256));
    let manager = upgraded.migration_manager(retrying());

    manager.regenerate_all().await.unwrap();
    let first = upgraded.vectors().get_all().unwrap();
    let report = manager.regenerate_all().await.unwrap();
    let second = upgraded.vectors().get_all().unwrap();

    assert_eq!(report.succeeded, NOTES.len());
    assert_eq!(report.pruned, 0);
    assert_eq!(first.len(), second.len());
    for (before, after) in first.iter().zip(&second) {
        assert_eq!(before.owner_id, after.owner_id);
        assert_eq!(before.vector, after.vector);
    }
}

#[tokio::test]
async fn test_regenerated_vectors_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vectors.bin");
    let (service, _) = service_with(VocabularyModel::new(128));
    seeded(&service).await;

    let upgraded = switch_model(&service, VocabularyModel::with_version("vocabulary-v2", 256))
        .with_vector_storage(VectorStorage::new(path.clone()));
    upgraded
        .migration_manager(retrying())
        .regenerate_all()
        .await
        .unwrap();

    let persisted = VectorStorage::new(path).load().unwrap();
    assert_eq!(persisted.len(), NOTES.len());
    assert!(persisted
        .iter()
        .all(|embedding| embedding.matches("vocabulary-v2", 256)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_pass_is_rejected() {
    let (service, _) = service_with(VocabularyModel::new(128));
    seeded(&service).await;

    let slow = switch_model(
        &service,
        SlowModel::new("slow-v1", Duration::from_millis(100)),
    );
    let manager = Arc::new(slow.migration_manager(retrying()));

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.regenerate_all().await })
    };
    while !manager.is_running() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(
        manager.regenerate_all().await,
        Err(MigrationError::AlreadyRunning)
    ));

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.succeeded, NOTES.len());
    assert!(!manager.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_managers_of_one_service_share_the_pass() {
    let (service, _) = service_with(VocabularyModel::new(128));
    seeded(&service).await;
    let slow = switch_model(
        &service,
        SlowModel::new("slow-v1", Duration::from_millis(100)),
    );

    let first = slow.migration_manager(retrying());
    let second = slow.migration_manager(retrying());
    assert!(!second.is_running());

    let running = tokio::spawn(async move { first.regenerate_all().await });
    while !second.is_running() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(
        second.regenerate_all().await,
        Err(MigrationError::AlreadyRunning)
    ));

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.succeeded, NOTES.len());
    assert!(!second.is_running());
    assert!(!slow.migration_manager(retrying()).needs_migration().unwrap());
}

#[tokio::test]
async fn test_progress_reports_every_item() {
    let (service, _) = service_with(VocabularyModel::new(128));
    seeded(&service).await;

    let mut calls = Vec::new();
    service
        .migration_manager(retrying())
        .regenerate_all_with(|done, total| calls.push((done, total)))
        .await
        .unwrap();

    let expected: Vec<_> = (1..=NOTES.len()).map(|done| (done, NOTES.len())).collect();
    assert_eq!(calls, expected);
}
