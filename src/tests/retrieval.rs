//! End-to-end retrieval: insert, index and search through the service.

use std::sync::Arc;

use crate::records::{Metadata, RecordStore};
use crate::semantic::embeddings::l2_norm;
use crate::semantic::index::cosine_similarity;
use crate::semantic::intent::Intent;
use crate::semantic::service::{RetrievalService, CORPUS_INTENT, QUERY_INTENT};
use crate::semantic::storage::VectorStorage;
use crate::tests::support::{service_with, FailingModel, VocabularyModel};

fn note(title: &str, body: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("title".to_string(), title.to_string());
    metadata.insert("body".to_string(), body.to_string());
    metadata
}

fn synthetic_document(sentences: usize) -> String {
    const TOPICS: [&str; 4] = ["rivers", "mountains", "orchards", "harbors"];
    (0..sentences)
        .map(|i| {
            format!(
                "Entry {i} of the survey describes the {} near the old road.",
                TOPICS[i % TOPICS.len()]
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::test]
async fn test_exact_query_ranks_its_item_first() {
    let (service, _) = service_with(VocabularyModel::new(128));

    let target = service
        .insert(
            "country roads take me home",
            note(
                "country roads take me home",
                "almost heaven West Virginia blue ridge mountains",
            ),
        )
        .await
        .unwrap();
    let unrelated = [
        service
            .insert("quarterly tax filing deadline reminder", Metadata::new())
            .await
            .unwrap(),
        service
            .insert("sourdough starter feeding schedule", Metadata::new())
            .await
            .unwrap(),
    ];

    let hits = service.search("country roads take me home", 10).await.unwrap();

    assert_eq!(hits[0].item.id, target);
    assert!(hits[0].score > 0.85, "top score {}", hits[0].score);
    for hit in &hits {
        if unrelated.contains(&hit.item.id) {
            assert!(hit.score < 0.5, "unrelated item scored {}", hit.score);
        }
    }
}

#[tokio::test]
async fn test_short_query_finds_related_items() {
    let (service, _) = service_with(VocabularyModel::new(128));

    let sweet = service.insert("home sweet home", Metadata::new()).await.unwrap();
    let roads = service
        .insert("country roads take me home", Metadata::new())
        .await
        .unwrap();
    let other = service
        .insert("quarterly tax filing deadline reminder", Metadata::new())
        .await
        .unwrap();

    let hits = service.search("home", 10).await.unwrap();
    let position = |id: u64| hits.iter().position(|hit| hit.item.id == id).unwrap();
    let score = |id: u64| hits[position(id)].score;

    assert!(position(sweet) < position(roads));
    assert!(position(roads) < position(other));
    // word overlap only: "home" twice out of three words, once out of five
    assert!((score(sweet) - 2.0 / 5f32.sqrt()).abs() < 1e-5);
    assert!((score(roads) - 1.0 / 5f32.sqrt()).abs() < 1e-5);
    assert!(score(other).abs() < 1e-6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_all_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vectors.bin");
    let (service, _) = service_with(VocabularyModel::new(1024));
    let service = Arc::new(service.with_vector_storage(VectorStorage::new(path.clone())));
    for i in 0..100 {
        service
            .insert(&format!("seed note {i}"), Metadata::new())
            .await
            .unwrap();
    }

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let service: Arc<RetrievalService> = service.clone();
            tokio::spawn(async move {
                service
                    .insert(&format!("concurrent note {i}"), Metadata::new())
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(service.records().items().unwrap().len(), 132);
    let persisted = VectorStorage::new(path).load().unwrap();
    assert_eq!(persisted.len(), 132);
    assert!(!dir.path().join("vectors.tmp").exists());
}

#[tokio::test]
async fn test_index_long_document_covers_source() {
    let (service, _) = service_with(VocabularyModel::new(1024));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("survey.txt");
    let text = synthetic_document(800);
    std::fs::write(&path, &text).unwrap();

    let report = service.index_document(&path, None).await.unwrap();

    assert!(report.chunks > 1);
    assert_eq!(report.embedded, report.chunks);
    assert_eq!(report.failed, 0);
    assert_eq!(report.document.title, "survey");
    assert_eq!(report.document.source.size_bytes, text.len() as u64);
    assert_eq!(report.document.source.page_count, 1);

    let chunks: Vec<_> = report
        .document
        .chunk_ids
        .iter()
        .map(|id| service.item(*id).unwrap().unwrap())
        .collect();

    let mut rebuilt = String::new();
    let mut covered_to = 0;
    for (index, chunk) in chunks.iter().enumerate() {
        let span = chunk.chunk.unwrap();
        assert_eq!(span.chunk_index, index);
        assert_eq!(span.document_id, report.document.id);
        assert!(span.start_offset <= covered_to, "gap before chunk {index}");
        assert!(span.end_offset > covered_to);
        assert!(crate::semantic::chunker::estimate_tokens(&chunk.text) <= 600);

        // drop the part already covered by the previous chunk
        rebuilt.push_str(&chunk.text[covered_to - span.start_offset..]);
        covered_to = span.end_offset;
    }
    assert_eq!(rebuilt, text);
}

#[tokio::test]
async fn test_document_chunks_are_searchable() {
    let (service, _) = service_with(VocabularyModel::new(1024));
    let report = service
        .index_text(
            "survey",
            &synthetic_document(200),
            crate::records::SourceMetadata::default(),
        )
        .await
        .unwrap();

    let first = service.item(report.document.chunk_ids[0]).unwrap().unwrap();
    let hits = service.search(&first.text, 3).await.unwrap();

    assert_eq!(hits[0].item.id, first.id);
    assert_eq!(hits[0].item.document_id(), Some(report.document.id));
    assert_eq!(hits[0].item.metadata["document_title"], "survey");
}

#[tokio::test]
async fn test_failed_chunk_is_stored_without_embedding() {
    let (service, _) = service_with(FailingModel::new("poison"));
    let text = format!(
        "{} The poison entry is here and it is long enough to matter for sizing. {}",
        synthetic_document(60),
        synthetic_document(60)
    );

    let report = service
        .index_text("mixed", &text, Default::default())
        .await
        .unwrap();

    assert!(report.failed >= 1);
    assert_eq!(report.embedded + report.failed, report.chunks);
    assert_eq!(service.records().items().unwrap().len(), report.chunks);
    assert_eq!(service.vectors().len(), report.embedded);
}

#[tokio::test]
async fn test_query_and_corpus_share_one_intent() {
    assert_eq!(QUERY_INTENT, CORPUS_INTENT);

    let (service, _) = service_with(VocabularyModel::new(128));
    let id = service.insert("alpha beta", Metadata::new()).await.unwrap();

    // the service embeds the query in the corpus space, so identical text
    // is a perfect match
    let hits = service.search("alpha beta", 1).await.unwrap();
    assert_eq!(hits[0].item.id, id);
    assert!(hits[0].score > 0.999);

    // a vector from another intent lives in another space; only its shape
    // is guaranteed
    let embedder = service.embedder();
    let document = embedder.embed("alpha beta", Intent::Document).await.unwrap();
    let search = embedder.embed("alpha beta", Intent::Search).await.unwrap();
    assert_eq!(document.len(), search.len());
    assert!((l2_norm(&search) - 1.0).abs() < 1e-5);
    let cross = cosine_similarity(&document, &search).unwrap();
    assert!(cross < hits[0].score);
}

#[tokio::test]
async fn test_deleted_chunk_leaves_document_consistent() {
    let (service, _) = service_with(VocabularyModel::new(1024));
    let report = service
        .index_text("survey", &synthetic_document(200), Default::default())
        .await
        .unwrap();
    let removed = report.document.chunk_ids[1];

    assert!(service.delete_item(removed).unwrap());

    let document = service.document(report.document.id).unwrap().unwrap();
    assert!(!document.chunk_ids.contains(&removed));
    let records: &Arc<dyn RecordStore> = service.records();
    assert_eq!(records.items().unwrap().len(), report.chunks - 1);
}

#[tokio::test]
#[ignore = "requires model download"]
async fn test_real_model_ranking() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(crate::semantic::Embedder::default());
    let config = crate::config::EmbedderConfig::default();
    {
        let embedder = embedder.clone();
        let base = dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || embedder.initialize(&config, &base))
            .await
            .unwrap()
            .unwrap();
    }
    let service = crate::semantic::RetrievalService::new(
        embedder,
        Arc::new(crate::records::CsvRecordStore::ephemeral()),
        Arc::new(crate::semantic::VectorStore::new()),
        Arc::new(crate::audit::MemoryAuditSink::default()),
    );

    let target = service
        .insert("country roads take me home", Metadata::new())
        .await
        .unwrap();
    let sweet = service.insert("home sweet home", Metadata::new()).await.unwrap();
    let other = service
        .insert("quarterly tax filing deadline reminder", Metadata::new())
        .await
        .unwrap();

    let hits = service.search("country roads take me home", 5).await.unwrap();
    assert_eq!(hits[0].item.id, target);
    assert!(hits[0].score > 0.85);
    assert!(hits[1].score < hits[0].score);

    let hits = service.search("home", 5).await.unwrap();
    let score = |id: u64| hits.iter().find(|hit| hit.item.id == id).unwrap().score;
    assert!(score(target) > 0.65, "score {}", score(target));
    assert!(score(sweet) > 0.65, "score {}", score(sweet));
    assert!(score(other) < score(target).min(score(sweet)));
}
