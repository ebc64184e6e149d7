//! Deterministic test doubles for the embedding model.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::MemoryAuditSink;
use crate::records::CsvRecordStore;
use crate::semantic::embeddings::{Embedder, EmbeddingError, InferenceModel};
use crate::semantic::index::VectorStore;
use crate::semantic::intent::Intent;
use crate::semantic::service::RetrievalService;

/// Split a prompt into its intent and the wrapped text.
fn unwrap_prompt(prompt: &str) -> (Option<Intent>, &str) {
    Intent::ALL
        .into_iter()
        .find_map(|intent| {
            prompt
                .strip_prefix(intent.template_prefix())
                .map(|text| (Some(intent), text))
        })
        .unwrap_or((None, prompt))
}

/// Bag-of-words model: each distinct lowercase word gets its own slot, in
/// order of first appearance, and the vector counts occurrences.
///
/// The intent template is not counted as words. Instead each intent shifts
/// every slot by a third of the vector, so the same text under two intents
/// lands on disjoint slots. Within one intent, cosine similarity is exact
/// word overlap of the texts, which makes ranking assertions predictable.
/// Slots wrap around `dimensions`: keep a test's vocabulary below a third
/// of it when intents are compared, and below `dimensions` otherwise.
pub struct VocabularyModel {
    version: String,
    dimensions: usize,
    vocabulary: HashMap<String, usize>,
}

impl VocabularyModel {
    pub fn new(dimensions: usize) -> Self {
        Self::with_version("vocabulary-v1", dimensions)
    }

    pub fn with_version(version: &str, dimensions: usize) -> Self {
        Self {
            version: version.to_string(),
            dimensions,
            vocabulary: HashMap::new(),
        }
    }

    fn vectorize(&mut self, prompt: &str) -> Vec<f32> {
        let (intent, text) = unwrap_prompt(prompt);
        let shift = match intent {
            Some(Intent::Search) => self.dimensions / 3,
            Some(Intent::QuestionAnswering) => 2 * (self.dimensions / 3),
            Some(Intent::Document) | None => 0,
        };

        let mut vector = vec![0.0; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
        {
            let next = self.vocabulary.len();
            let slot = *self.vocabulary.entry(word.to_lowercase()).or_insert(next);
            vector[(slot + shift) % self.dimensions] += 1.0;
        }
        vector
    }
}

impl InferenceModel for VocabularyModel {
    fn version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn infer(&mut self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.vectorize(prompt))
    }
}

/// Vocabulary model that fails on every prompt containing `marker`.
pub struct FailingModel {
    inner: VocabularyModel,
    marker: String,
}

impl FailingModel {
    pub fn new(marker: &str) -> Self {
        Self {
            inner: VocabularyModel::new(128),
            marker: marker.to_string(),
        }
    }
}

impl InferenceModel for FailingModel {
    fn version(&self) -> &str {
        self.inner.version()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn infer(&mut self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        if prompt.contains(&self.marker) {
            return Err(EmbeddingError::GenerationFailed(format!(
                "refusing prompt containing '{}'",
                self.marker
            )));
        }
        self.inner.infer(prompt)
    }
}

/// Vocabulary model that fails the first attempt for each distinct prompt.
pub struct FlakyModel {
    inner: VocabularyModel,
    seen: HashMap<String, usize>,
}

impl FlakyModel {
    pub fn new(version: &str) -> Self {
        Self {
            inner: VocabularyModel::with_version(version, 128),
            seen: HashMap::new(),
        }
    }
}

impl InferenceModel for FlakyModel {
    fn version(&self) -> &str {
        self.inner.version()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn infer(&mut self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        let attempts = self.seen.entry(prompt.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts == 1 {
            return Err(EmbeddingError::GenerationFailed(
                "transient failure".to_string(),
            ));
        }
        self.inner.infer(prompt)
    }
}

/// Model that points `anchor` along the first axis and every other text
/// almost the opposite way, so their cosine similarity is negative.
pub struct PolarModel {
    anchor: String,
    dimensions: usize,
}

impl PolarModel {
    pub fn new(anchor: &str) -> Self {
        Self {
            anchor: anchor.to_string(),
            dimensions: 128,
        }
    }
}

impl InferenceModel for PolarModel {
    fn version(&self) -> &str {
        "polar-v1"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn infer(&mut self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        let (_, text) = unwrap_prompt(prompt);
        let mut vector = vec![0.0; self.dimensions];
        if text == self.anchor {
            vector[0] = 1.0;
        } else {
            vector[0] = -1.0;
            vector[1] = 0.2;
        }
        Ok(vector)
    }
}

/// Vocabulary model that sleeps before every inference.
pub struct SlowModel {
    inner: VocabularyModel,
    delay: Duration,
}

impl SlowModel {
    pub fn new(version: &str, delay: Duration) -> Self {
        Self {
            inner: VocabularyModel::with_version(version, 128),
            delay,
        }
    }
}

impl InferenceModel for SlowModel {
    fn version(&self) -> &str {
        self.inner.version()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn infer(&mut self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        std::thread::sleep(self.delay);
        self.inner.infer(prompt)
    }
}

pub fn embedder_with(model: impl InferenceModel + 'static) -> Arc<Embedder> {
    let embedder = Arc::new(Embedder::default());
    embedder
        .initialize_with(Box::new(model), None)
        .expect("test model must initialize");
    embedder
}

/// In-memory service around `model`, plus the sink receiving its audit
/// events.
pub fn service_with(
    model: impl InferenceModel + 'static,
) -> (RetrievalService, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::default());
    let service = RetrievalService::new(
        embedder_with(model),
        Arc::new(CsvRecordStore::ephemeral()),
        Arc::new(VectorStore::new()),
        audit.clone(),
    );
    (service, audit)
}

/// A second service over the same stores, with a different model.
pub fn switch_model(
    service: &RetrievalService,
    model: impl InferenceModel + 'static,
) -> RetrievalService {
    RetrievalService::new(
        embedder_with(model),
        service.records().clone(),
        service.vectors().clone(),
        Arc::new(MemoryAuditSink::default()),
    )
}
