//! Document extraction.
//!
//! Turning raw bytes into text is the extractor's job; the retrieval
//! engine only consumes [`ExtractedDocument`].

use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid UTF-8 text", .0.display())]
    NotText(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentInfo {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creation_date: Option<String>,
    pub page_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedDocument {
    pub full_text: String,
    pub pages: Vec<String>,
    pub metadata: DocumentInfo,
    pub size_bytes: u64,
}

pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractionError>;
}

/// Reads UTF-8 text files. Form feeds separate pages.
#[derive(Debug, Default, Clone)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    pub fn extract_str(text: &str, title: Option<String>) -> ExtractedDocument {
        let pages: Vec<String> = text
            .split('\u{000C}')
            .map(|page| page.to_string())
            .collect();
        let full_text = pages.join("\n\n");

        ExtractedDocument {
            metadata: DocumentInfo {
                title,
                page_count: pages.len(),
                ..Default::default()
            },
            size_bytes: text.len() as u64,
            full_text,
            pages,
        }
    }
}

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractionError> {
        let bytes = std::fs::read(path).map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let text =
            String::from_utf8(bytes).map_err(|_| ExtractionError::NotText(path.to_path_buf()))?;

        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());

        let mut document = Self::extract_str(&text, title);
        if let Ok(meta) = std::fs::metadata(path) {
            document.metadata.creation_date = meta
                .created()
                .or_else(|_| meta.modified())
                .ok()
                .map(|ts| chrono::DateTime::<chrono::Utc>::from(ts).to_rfc3339());
        }
        Ok(document)
    }
}
