use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    ChunkSpan, Document, Item, Metadata, NewChunk, NewDocument, NewItem, RecordError, RecordStore,
    SourceMetadata,
};

const ITEMS_FILE: &str = "items.csv";
const DOCUMENTS_FILE: &str = "documents.csv";

/// One line of `items.csv`.
///
/// Columns added after the first release carry `#[serde(default)]` so files
/// written by older versions keep loading.
#[derive(Debug, Serialize, Deserialize)]
struct ItemRow {
    id: u64,
    text: String,
    metadata: String,
    created_at: String,
    #[serde(default)]
    document_id: Option<u64>,
    #[serde(default)]
    chunk_index: Option<usize>,
    #[serde(default)]
    start_offset: Option<usize>,
    #[serde(default)]
    end_offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRow {
    id: u64,
    title: String,
    chunk_ids: String,
    created_at: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    creation_date: Option<String>,
    #[serde(default)]
    page_count: usize,
    #[serde(default)]
    size_bytes: u64,
}

#[derive(Debug, Default, Clone)]
struct State {
    items: BTreeMap<u64, Item>,
    documents: BTreeMap<u64, Document>,
    next_item_id: u64,
    next_document_id: u64,
}

impl State {
    fn allocate_item_id(&mut self) -> u64 {
        self.next_item_id += 1;
        self.next_item_id
    }

    fn allocate_document_id(&mut self) -> u64 {
        self.next_document_id += 1;
        self.next_document_id
    }
}

/// Record store persisted as two CSV files in a directory.
///
/// The whole corpus is held in memory. A mutation is applied to a copy of
/// the state, the affected files are rewritten from that copy, and only
/// then does the copy replace the live state. A failed write leaves both
/// memory and disk as they were.
#[derive(Debug)]
pub struct CsvRecordStore {
    state: RwLock<State>,
    dir: Option<PathBuf>,
}

impl CsvRecordStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self, RecordError> {
        std::fs::create_dir_all(dir)?;

        let now = Instant::now();
        let items = read_rows::<ItemRow>(&dir.join(ITEMS_FILE))?
            .into_iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let documents = read_rows::<DocumentRow>(&dir.join(DOCUMENTS_FILE))?
            .into_iter()
            .map(document_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let state = State {
            next_item_id: items.iter().map(|item| item.id).max().unwrap_or(0),
            next_document_id: documents.iter().map(|doc| doc.id).max().unwrap_or(0),
            items: items.into_iter().map(|item| (item.id, item)).collect(),
            documents: documents.into_iter().map(|doc| (doc.id, doc)).collect(),
        };

        log::debug!(
            "loaded {} items and {} documents in {}ms",
            state.items.len(),
            state.documents.len(),
            now.elapsed().as_micros() as f64 / 1000.0
        );

        Ok(Self {
            state: RwLock::new(state),
            dir: Some(dir.to_path_buf()),
        })
    }

    /// A store that lives only in memory.
    pub fn ephemeral() -> Self {
        Self {
            state: RwLock::new(State::default()),
            dir: None,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, RecordError> {
        self.state.read().map_err(|_| RecordError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, RecordError> {
        self.state.write().map_err(|_| RecordError::Poisoned)
    }

    fn persist_items(&self, state: &State) -> Result<(), RecordError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let rows = state.items.values().map(item_to_row);
        write_rows(&dir.join(ITEMS_FILE), rows)
    }

    fn persist_documents(&self, state: &State) -> Result<(), RecordError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let rows = state.documents.values().map(document_to_row);
        write_rows(&dir.join(DOCUMENTS_FILE), rows)
    }

    /// Write the touched files from `staged`, then install it as `live`.
    ///
    /// When `documents.csv` fails after `items.csv` was already replaced,
    /// `items.csv` is rewritten from `live` again.
    fn commit(
        &self,
        live: &mut State,
        staged: State,
        items: bool,
        documents: bool,
    ) -> Result<(), RecordError> {
        if items {
            self.persist_items(&staged)?;
        }
        if documents {
            if let Err(err) = self.persist_documents(&staged) {
                if items {
                    if let Err(restore) = self.persist_items(live) {
                        log::error!("Failed to restore {ITEMS_FILE} after a failed write: {restore}");
                    }
                }
                return Err(err);
            }
        }

        *live = staged;
        Ok(())
    }
}

impl RecordStore for CsvRecordStore {
    fn insert_item(&self, item: NewItem) -> Result<Item, RecordError> {
        let mut state = self.write()?;
        let mut staged = state.clone();

        let item = Item {
            id: staged.allocate_item_id(),
            text: item.text,
            metadata: item.metadata,
            created_at: Utc::now(),
            chunk: None,
        };
        staged.items.insert(item.id, item.clone());
        self.commit(&mut state, staged, true, false)?;

        Ok(item)
    }

    fn item(&self, id: u64) -> Result<Option<Item>, RecordError> {
        Ok(self.read()?.items.get(&id).cloned())
    }

    fn items(&self) -> Result<Vec<Item>, RecordError> {
        Ok(self.read()?.items.values().cloned().collect())
    }

    fn delete_item(&self, id: u64) -> Result<bool, RecordError> {
        let mut state = self.write()?;
        if !state.items.contains_key(&id) {
            return Ok(false);
        }

        let mut staged = state.clone();
        let mut documents_touched = false;
        if let Some(removed) = staged.items.remove(&id) {
            // a chunk deleted on its own must not linger in its document's list
            if let Some(document_id) = removed.document_id() {
                if let Some(document) = staged.documents.get_mut(&document_id) {
                    document.chunk_ids.retain(|chunk_id| *chunk_id != id);
                    documents_touched = true;
                }
            }
        }
        self.commit(&mut state, staged, true, documents_touched)?;

        Ok(true)
    }

    fn insert_document(
        &self,
        document: NewDocument,
        chunks: Vec<NewChunk>,
    ) -> Result<(Document, Vec<Item>), RecordError> {
        let mut state = self.write()?;
        let mut staged = state.clone();

        let document_id = staged.allocate_document_id();
        let created_at = Utc::now();

        let mut stored = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let item = Item {
                id: staged.allocate_item_id(),
                text: chunk.text,
                metadata: chunk.metadata,
                created_at,
                chunk: Some(ChunkSpan {
                    document_id,
                    chunk_index: chunk.chunk_index,
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                }),
            };
            stored.push(item);
        }

        let document = Document {
            id: document_id,
            title: document.title,
            chunk_ids: stored.iter().map(|item| item.id).collect(),
            source: document.source,
            created_at,
        };

        for item in &stored {
            staged.items.insert(item.id, item.clone());
        }
        staged.documents.insert(document_id, document.clone());
        self.commit(&mut state, staged, true, true)?;

        Ok((document, stored))
    }

    fn document(&self, id: u64) -> Result<Option<Document>, RecordError> {
        Ok(self.read()?.documents.get(&id).cloned())
    }

    fn documents(&self) -> Result<Vec<Document>, RecordError> {
        Ok(self.read()?.documents.values().cloned().collect())
    }

    fn delete_document(&self, id: u64) -> Result<Vec<u64>, RecordError> {
        let mut state = self.write()?;
        if !state.documents.contains_key(&id) {
            return Err(RecordError::DocumentNotFound(id));
        }

        let mut staged = state.clone();
        let document = staged
            .documents
            .remove(&id)
            .ok_or(RecordError::DocumentNotFound(id))?;

        // sweep by owner as well, in case chunk_ids drifted from the items
        let mut removed: Vec<u64> = staged
            .items
            .values()
            .filter(|item| item.document_id() == Some(id))
            .map(|item| item.id)
            .collect();
        for chunk_id in document.chunk_ids {
            if !removed.contains(&chunk_id) && staged.items.contains_key(&chunk_id) {
                removed.push(chunk_id);
            }
        }
        for chunk_id in &removed {
            staged.items.remove(chunk_id);
        }
        removed.sort_unstable();

        self.commit(&mut state, staged, true, true)?;

        Ok(removed)
    }
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, RecordError> {
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(err) => {
            let missing = matches!(
                err.kind(),
                csv::ErrorKind::Io(io) if io.kind() == ErrorKind::NotFound
            );
            if missing {
                log::info!("Creating new record file at {}", path.display());
                return Ok(Vec::new());
            }
            return Err(err.into());
        }
    };

    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

fn write_rows<T: Serialize>(
    path: &Path,
    rows: impl Iterator<Item = T>,
) -> Result<(), RecordError> {
    let temp_path = path.with_extension("csv-tmp");

    let result = (|| {
        let mut writer = csv::Writer::from_path(&temp_path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok::<_, RecordError>(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn parse_timestamp(id: u64, raw: &str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| RecordError::Corrupt {
            id,
            reason: format!("bad timestamp {raw:?}: {err}"),
        })
}

fn item_to_row(item: &Item) -> ItemRow {
    ItemRow {
        id: item.id,
        text: item.text.clone(),
        metadata: serde_json::to_string(&item.metadata).unwrap_or_else(|_| "{}".to_string()),
        created_at: item.created_at.to_rfc3339(),
        document_id: item.chunk.map(|span| span.document_id),
        chunk_index: item.chunk.map(|span| span.chunk_index),
        start_offset: item.chunk.map(|span| span.start_offset),
        end_offset: item.chunk.map(|span| span.end_offset),
    }
}

fn item_from_row(row: ItemRow) -> Result<Item, RecordError> {
    let metadata: Metadata = if row.metadata.trim().is_empty() {
        Metadata::new()
    } else {
        serde_json::from_str(&row.metadata).map_err(|err| RecordError::Corrupt {
            id: row.id,
            reason: format!("bad metadata: {err}"),
        })?
    };

    let chunk = match (row.document_id, row.chunk_index) {
        (Some(document_id), Some(chunk_index)) => Some(ChunkSpan {
            document_id,
            chunk_index,
            start_offset: row.start_offset.unwrap_or(0),
            end_offset: row.end_offset.unwrap_or(0),
        }),
        (None, None) => None,
        _ => {
            return Err(RecordError::Corrupt {
                id: row.id,
                reason: "chunk columns partially set".to_string(),
            })
        }
    };

    Ok(Item {
        id: row.id,
        created_at: parse_timestamp(row.id, &row.created_at)?,
        text: row.text,
        metadata,
        chunk,
    })
}

fn document_to_row(document: &Document) -> DocumentRow {
    DocumentRow {
        id: document.id,
        title: document.title.clone(),
        chunk_ids: document
            .chunk_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" "),
        created_at: document.created_at.to_rfc3339(),
        author: document.source.author.clone(),
        subject: document.source.subject.clone(),
        creation_date: document.source.creation_date.clone(),
        page_count: document.source.page_count,
        size_bytes: document.source.size_bytes,
    }
}

fn document_from_row(row: DocumentRow) -> Result<Document, RecordError> {
    let chunk_ids = row
        .chunk_ids
        .split_whitespace()
        .map(|raw| raw.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| RecordError::Corrupt {
            id: row.id,
            reason: format!("bad chunk id list: {err}"),
        })?;

    Ok(Document {
        id: row.id,
        created_at: parse_timestamp(row.id, &row.created_at)?,
        title: row.title,
        chunk_ids,
        source: SourceMetadata {
            author: row.author,
            subject: row.subject,
            creation_date: row.creation_date,
            page_count: row.page_count,
            size_bytes: row.size_bytes,
        },
    })
}
