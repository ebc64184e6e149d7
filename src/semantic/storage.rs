//! Persistence for embeddings.
//!
//! Primary form: vectors.bin
//!
//! Header (21 bytes):
//! - magic: [u8; 4] ("RCLV")
//! - version: u8 (2)
//! - entry_count: u64 (little-endian)
//! - body_checksum: u32 (CRC32 of all entry bytes)
//! - header_checksum: u32 (CRC32 of the preceding 17 header bytes)
//!
//! Entries (repeated, variable size):
//! - owner_id: u64
//! - created_at: i64 (unix millis)
//! - dimension: u16
//! - model_version_len: u16, model_version: UTF-8 bytes
//! - vector: [f32; dimension]
//!
//! All integers and floats are little-endian. Each entry carries its own
//! dimension and model version so stale embeddings survive a reload and
//! can be detected by the migration manager.
//!
//! A comma-separated text form of vectors is available for export and
//! debugging; it round-trips exactly.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};

use crate::semantic::index::{Embedding, VectorError, VectorStore};

const MAGIC: &[u8; 4] = b"RCLV";

/// Current file format version
const FORMAT_VERSION: u8 = 2;

/// magic(4) + version(1) + entry_count(8) + body_checksum(4) + header_checksum(4)
const HEADER_SIZE: usize = 21;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Malformed vector text at position {position}: {reason}")]
    SerializationFailure { position: usize, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),
}

/// Storage manager for embeddings.
///
/// Writes from one process are serialized: every save goes through the
/// same temp file, and a snapshot taken by [`VectorStorage::save_store`]
/// is never overwritten by an older one.
pub struct VectorStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl VectorStorage {
    /// Create a new storage manager for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Get the storage file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the storage file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load every stored embedding.
    pub fn load(&self) -> Result<Vec<Embedding>, StorageError> {
        let bytes = std::fs::read(&self.path)?;
        decode(&bytes)
    }

    /// Save embeddings.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save<'a>(
        &self,
        embeddings: impl IntoIterator<Item = &'a Embedding>,
    ) -> Result<(), StorageError> {
        let bytes = encode(embeddings)?;
        let _guard = self.lock();
        self.write_atomic(&bytes)
    }

    /// Snapshot `store` and save it, both under the write lock.
    pub fn save_store(&self, store: &VectorStore) -> Result<(), StorageError> {
        let _guard = self.lock();
        let embeddings = store.get_all()?;
        let bytes = encode(&embeddings)?;
        self.write_atomic(&bytes)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_atomic(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = Self::write_to_file(&temp_path, bytes);
        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Delete the storage file if it exists.
    pub fn delete(&self) -> Result<(), StorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;
        Ok(())
    }
}

/// Encode embeddings into the vectors.bin layout.
pub fn encode<'a>(
    embeddings: impl IntoIterator<Item = &'a Embedding>,
) -> Result<Vec<u8>, StorageError> {
    let mut body = Vec::new();
    let mut count: u64 = 0;

    for embedding in embeddings {
        if embedding.vector.len() != embedding.dimension {
            return Err(StorageError::InvalidFormat(format!(
                "embedding of owner {} declares {} dimensions but holds {}",
                embedding.owner_id,
                embedding.dimension,
                embedding.vector.len()
            )));
        }
        let dimension = u16::try_from(embedding.dimension).map_err(|_| {
            StorageError::InvalidFormat(format!("dimension {} too large", embedding.dimension))
        })?;
        let version = embedding.model_version.as_bytes();
        let version_len = u16::try_from(version.len()).map_err(|_| {
            StorageError::InvalidFormat("model version tag too long".to_string())
        })?;

        body.extend_from_slice(&embedding.owner_id.to_le_bytes());
        body.extend_from_slice(&embedding.created_at.timestamp_millis().to_le_bytes());
        body.extend_from_slice(&dimension.to_le_bytes());
        body.extend_from_slice(&version_len.to_le_bytes());
        body.extend_from_slice(version);
        for &value in &embedding.vector {
            body.extend_from_slice(&value.to_le_bytes());
        }
        count += 1;
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&count.to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    let header_checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&header_checksum.to_le_bytes());
    bytes.extend_from_slice(&body);

    Ok(bytes)
}

/// Decode the vectors.bin layout.
pub fn decode(bytes: &[u8]) -> Result<Vec<Embedding>, StorageError> {
    if bytes.len() < HEADER_SIZE {
        return Err(StorageError::InvalidFormat(format!(
            "file is {} bytes, shorter than the {HEADER_SIZE}-byte header",
            bytes.len()
        )));
    }
    if &bytes[0..4] != MAGIC {
        return Err(StorageError::InvalidFormat("bad magic".to_string()));
    }

    let version = bytes[4];
    if version != FORMAT_VERSION {
        return Err(StorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut reader = Reader::new(&bytes[5..HEADER_SIZE]);
    let entry_count = reader.u64()?;
    let body_checksum = reader.u32()?;
    let header_checksum = reader.u32()?;
    if crc32fast::hash(&bytes[0..HEADER_SIZE - 4]) != header_checksum {
        return Err(StorageError::ChecksumMismatch);
    }

    let body = &bytes[HEADER_SIZE..];
    if crc32fast::hash(body) != body_checksum {
        return Err(StorageError::ChecksumMismatch);
    }

    let mut reader = Reader::new(body);
    let mut embeddings = Vec::with_capacity(entry_count.min(1 << 20) as usize);
    for _ in 0..entry_count {
        let owner_id = reader.u64()?;
        let created_millis = reader.i64()?;
        let dimension = reader.u16()? as usize;
        let version_len = reader.u16()? as usize;
        let model_version = String::from_utf8(reader.take(version_len)?.to_vec())
            .map_err(|_| StorageError::InvalidFormat("model version is not UTF-8".to_string()))?;

        let mut vector = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            vector.push(reader.f32()?);
        }

        let created_at: DateTime<Utc> = Utc
            .timestamp_millis_opt(created_millis)
            .single()
            .unwrap_or_else(Utc::now);

        embeddings.push(Embedding {
            owner_id,
            vector,
            dimension,
            model_version,
            created_at,
        });
    }

    if !reader.is_empty() {
        return Err(StorageError::InvalidFormat(
            "trailing bytes after last entry".to_string(),
        ));
    }

    Ok(embeddings)
}

/// Little-endian cursor over a byte slice.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StorageError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| StorageError::InvalidFormat("unexpected end of data".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], StorageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, StorageError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, StorageError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, StorageError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, StorageError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, StorageError> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

/// Render a vector as comma-separated decimals.
///
/// Uses the shortest representation that parses back to the same `f32`,
/// so [`parse_vector`] restores the exact values.
pub fn serialize_vector(vector: &[f32]) -> String {
    vector
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse the comma-separated form produced by [`serialize_vector`].
///
/// An empty or blank string is the empty vector.
pub fn parse_vector(text: &str) -> Result<Vec<f32>, StorageError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    text.split(',')
        .enumerate()
        .map(|(position, raw)| {
            let raw = raw.trim();
            let value: f32 = raw.parse().map_err(|e| StorageError::SerializationFailure {
                position,
                reason: format!("{raw:?}: {e}"),
            })?;
            if !value.is_finite() {
                return Err(StorageError::SerializationFailure {
                    position,
                    reason: format!("{raw:?} is not a finite number"),
                });
            }
            Ok(value)
        })
        .collect()
}

/// Write embeddings as CSV: owner_id, model_version, dimension,
/// created_at, vector.
pub fn export_text<'a, W: std::io::Write>(
    writer: W,
    embeddings: impl IntoIterator<Item = &'a Embedding>,
) -> Result<usize, StorageError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(["owner_id", "model_version", "dimension", "created_at", "vector"])?;

    let mut count = 0;
    for embedding in embeddings {
        csv_writer.write_record([
            embedding.owner_id.to_string(),
            embedding.model_version.clone(),
            embedding.dimension.to_string(),
            embedding.created_at.to_rfc3339(),
            serialize_vector(&embedding.vector),
        ])?;
        count += 1;
    }
    csv_writer.flush()?;

    Ok(count)
}

/// Read the CSV written by [`export_text`].
pub fn import_text<R: std::io::Read>(reader: R) -> Result<Vec<Embedding>, StorageError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut embeddings = Vec::new();

    for record in csv_reader.records() {
        let record = record?;
        let field = |idx: usize, name: &str| {
            record
                .get(idx)
                .ok_or_else(|| StorageError::InvalidFormat(format!("missing column {name}")))
        };

        let owner_id = field(0, "owner_id")?
            .parse::<u64>()
            .map_err(|e| StorageError::InvalidFormat(format!("bad owner_id: {e}")))?;
        let model_version = field(1, "model_version")?.to_string();
        let dimension = field(2, "dimension")?
            .parse::<usize>()
            .map_err(|e| StorageError::InvalidFormat(format!("bad dimension: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(field(3, "created_at")?)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| StorageError::InvalidFormat(format!("bad created_at: {e}")))?;
        let vector = parse_vector(field(4, "vector")?)?;

        if vector.len() != dimension {
            return Err(StorageError::InvalidFormat(format!(
                "owner {owner_id}: dimension {dimension} but {} values",
                vector.len()
            )));
        }

        embeddings.push(Embedding {
            owner_id,
            vector,
            dimension,
            model_version,
            created_at,
        });
    }

    Ok(embeddings)
}
