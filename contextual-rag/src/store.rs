//! File-backed, per-user document store with cosine-similarity search.
//!
//! Each document is written as two JSON records sharing one key:
//!
//! ```text
//! <base>/docs/<user>/<key>.json     metadata: filename, full text, timestamp, chunk count
//! <base>/embeds/<user>/<key>.json   chunks with their embeddings
//! ```
//!
//! `<user>` is `u` followed by the URL-safe base64 of the user id, so every
//! distinct id gets its own directory.
//!
//! Keys are `<timestamp>_<sanitized filename>`, so sorting by key gives
//! insertion order. Writes are fatal on failure. Reads skip unreadable
//! records and report them as [`StoreWarning`]s instead of failing.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::RagConfig;
use crate::document::{EmbeddedChunk, ProcessedDocument, RelevantChunk};
use crate::error::{RagError, Result};

/// Version written into every record. Records with another version are skipped.
pub const SCHEMA_VERSION: u32 = 1;

/// Original text reported by [`DocumentStore::list_documents`].
pub const PLACEHOLDER_TEXT: &str = "[Content available - use get_document for full text]";

const MAX_NAME_CHARS: usize = 100;
const MAX_KEY_ATTEMPTS: usize = 1000;
const DOCS_DIR: &str = "docs";
const EMBEDS_DIR: &str = "embeds";

/// A record that was skipped while reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWarning {
    /// The file or directory that could not be used.
    pub path: PathBuf,
    /// Why it was skipped.
    pub reason: String,
}

impl fmt::Display for StoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipped {}: {}", self.path.display(), self.reason)
    }
}

/// The result of a read together with the records it had to skip.
#[derive(Debug, Clone)]
pub struct StoreRead<T> {
    /// What could be read.
    pub value: T,
    /// Records skipped along the way, in the order they were met.
    pub warnings: Vec<StoreWarning>,
}

impl<T> StoreRead<T> {
    /// Whether every record was read successfully.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Transform the value, keeping the warnings.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StoreRead<U> {
        StoreRead { value: f(self.value), warnings: self.warnings }
    }
}

trait Record: DeserializeOwned {
    fn schema_version(&self) -> u32;
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataRecord {
    schema_version: u32,
    filename: String,
    original_text: String,
    upload_timestamp: DateTime<Utc>,
    chunk_count: usize,
}

impl Record for MetadataRecord {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EmbeddingRecord {
    schema_version: u32,
    filename: String,
    upload_timestamp: DateTime<Utc>,
    chunks: Vec<EmbeddedChunk>,
}

impl Record for EmbeddingRecord {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// Persists [`ProcessedDocument`]s per user and searches their chunks.
///
/// # Example
///
/// ```rust,ignore
/// use contextual_rag::DocumentStore;
///
/// let store = DocumentStore::new("./filestore");
/// store.store("user-1", &document).await?;
/// let hits = store.search(&query_embedding, "user-1", 10).await;
/// ```
#[derive(Debug, Clone)]
pub struct DocumentStore {
    base_path: PathBuf,
    search_floor: f32,
}

impl DocumentStore {
    /// Create a store rooted at `base_path` with the default search floor of 0.1.
    ///
    /// Directories are created lazily on the first write.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into(), search_floor: 0.1 }
    }

    /// Create a store using the path and search floor from a [`RagConfig`].
    pub fn from_config(config: &RagConfig) -> Self {
        Self::new(&config.storage_path).with_search_floor(config.search_floor)
    }

    /// Set the score at or below which search results are discarded.
    pub fn with_search_floor(mut self, floor: f32) -> Self {
        self.search_floor = floor;
        self
    }

    /// The root directory of the store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn user_dir(&self, kind: &str, user_id: &str) -> PathBuf {
        self.base_path.join(kind).join(user_dir_name(user_id))
    }

    /// Persist a document for `user_id` and return the key it was stored under.
    ///
    /// If the key is already taken, the timestamp part is advanced one
    /// microsecond at a time until a free key is found, so concurrent uploads
    /// of the same file never overwrite each other and key order stays
    /// insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::StorageError`] if a directory or record cannot be
    /// written. A half-written document is removed before returning.
    pub async fn store(&self, user_id: &str, document: &ProcessedDocument) -> Result<String> {
        let docs_dir = self.user_dir(DOCS_DIR, user_id);
        let embeds_dir = self.user_dir(EMBEDS_DIR, user_id);
        for dir in [&docs_dir, &embeds_dir] {
            fs::create_dir_all(dir).await.map_err(|e| storage_error("create_dir", dir, e))?;
        }

        let metadata = serde_json::to_vec_pretty(&MetadataRecord {
            schema_version: SCHEMA_VERSION,
            filename: document.filename.clone(),
            original_text: document.original_text.clone(),
            upload_timestamp: document.upload_timestamp,
            chunk_count: document.chunks.len(),
        })
        .map_err(|e| RagError::StorageError {
            operation: "serialize_metadata".into(),
            message: e.to_string(),
        })?;
        let embeddings = serde_json::to_vec(&EmbeddingRecord {
            schema_version: SCHEMA_VERSION,
            filename: document.filename.clone(),
            upload_timestamp: document.upload_timestamp,
            chunks: document.chunks.clone(),
        })
        .map_err(|e| RagError::StorageError {
            operation: "serialize_embeddings".into(),
            message: e.to_string(),
        })?;

        let name = sanitize_filename(&document.filename);
        let mut stamp = document.upload_timestamp;

        for _ in 0..MAX_KEY_ATTEMPTS {
            let key = format!("{}_{name}", stamp.format("%Y%m%d_%H%M%S_%6f"));
            let metadata_path = docs_dir.join(format!("{key}.json"));
            let embeds_path = embeds_dir.join(format!("{key}.json"));
            stamp += TimeDelta::microseconds(1);

            match write_new(&metadata_path, &metadata).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(storage_error("write_metadata", &metadata_path, e)),
            }

            match write_new(&embeds_path, &embeddings).await {
                Ok(()) => {
                    info!(
                        user_id,
                        key = %key,
                        chunk_count = document.chunks.len(),
                        "stored document"
                    );
                    return Ok(key);
                }
                Err(e) => {
                    let _ = fs::remove_file(&metadata_path).await;
                    if e.kind() == ErrorKind::AlreadyExists {
                        continue;
                    }
                    return Err(storage_error("write_embeddings", &embeds_path, e));
                }
            }
        }

        Err(RagError::StorageError {
            operation: "store_document".into(),
            message: format!("no free key for '{}'", document.filename),
        })
    }

    /// All documents of `user_id` in insertion order.
    ///
    /// Only embedding records are read, so each document carries
    /// [`PLACEHOLDER_TEXT`] instead of its full text. Use
    /// [`get_document`](Self::get_document) for the text.
    pub async fn list_documents(&self, user_id: &str) -> StoreRead<Vec<ProcessedDocument>> {
        let mut warnings = Vec::new();
        let records = read_records::<EmbeddingRecord>(
            &self.user_dir(EMBEDS_DIR, user_id),
            &mut warnings,
        )
        .await;

        let mut documents = Vec::with_capacity(records.len());
        for (path, record) in records {
            match ProcessedDocument::new(
                record.filename,
                PLACEHOLDER_TEXT,
                record.chunks,
                record.upload_timestamp,
            ) {
                Ok(document) => documents.push(document),
                Err(e) => skip(&mut warnings, path, e.to_string()),
            }
        }

        debug!(user_id, document_count = documents.len(), "listed documents");
        StoreRead { value: documents, warnings }
    }

    /// The most recent document of `user_id` stored under exactly `filename`,
    /// with its full text.
    pub async fn get_document(
        &self,
        user_id: &str,
        filename: &str,
    ) -> StoreRead<Option<ProcessedDocument>> {
        let mut warnings = Vec::new();
        let records = read_records::<EmbeddingRecord>(
            &self.user_dir(EMBEDS_DIR, user_id),
            &mut warnings,
        )
        .await;
        let docs_dir = self.user_dir(DOCS_DIR, user_id);

        for (path, record) in records.into_iter().rev().filter(|(_, r)| r.filename == filename) {
            let Some(file_name) = path.file_name() else { continue };
            let metadata_path = docs_dir.join(file_name);
            let Some(metadata) = read_record::<MetadataRecord>(&metadata_path, &mut warnings).await
            else {
                continue;
            };
            match ProcessedDocument::new(
                record.filename,
                metadata.original_text,
                record.chunks,
                record.upload_timestamp,
            ) {
                Ok(document) => return StoreRead { value: Some(document), warnings },
                Err(e) => skip(&mut warnings, path, e.to_string()),
            }
        }

        StoreRead { value: None, warnings }
    }

    /// The `top_k` chunks of `user_id` most similar to `query_embedding`.
    ///
    /// Scores at or below the search floor are dropped before truncation.
    /// Equal scores keep insertion order. Returned scores are clamped into
    /// `[0.0, 1.0]`.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        user_id: &str,
        top_k: usize,
    ) -> StoreRead<Vec<RelevantChunk>> {
        let floor = self.search_floor;
        self.list_documents(user_id).await.map(|documents| {
            let mut scored: Vec<(EmbeddedChunk, f32)> = documents
                .into_iter()
                .flat_map(|document| document.chunks)
                .map(|chunk| {
                    let score = cosine_similarity(query_embedding, &chunk.embedding);
                    (chunk, score)
                })
                .filter(|(_, score)| *score > floor)
                .collect();

            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k);

            scored
                .into_iter()
                .filter_map(|(chunk, score)| RelevantChunk::new(chunk, score.clamp(0.0, 1.0)).ok())
                .collect()
        })
    }

    /// Remove every document of `user_id` and return how many were removed.
    ///
    /// Clearing a user with no documents is a no-op returning 0.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::StorageError`] if a directory exists but cannot be
    /// removed.
    pub async fn clear(&self, user_id: &str) -> Result<usize> {
        let embeds_dir = self.user_dir(EMBEDS_DIR, user_id);
        let removed = count_records(&embeds_dir).await;

        for dir in [self.user_dir(DOCS_DIR, user_id), embeds_dir] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(storage_error("clear", &dir, e)),
            }
        }

        info!(user_id, removed, "cleared documents");
        Ok(removed)
    }
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 if either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Make a filename safe to use as part of a store key.
///
/// Characters other than alphanumerics, `.`, `-` and `_` become `_`. Names
/// longer than 100 characters keep their extension and lose the end of the
/// stem.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();

    if cleaned.chars().count() <= MAX_NAME_CHARS {
        return cleaned;
    }

    let (stem, ext) = match cleaned.rfind('.') {
        Some(dot) if dot > 0 => cleaned.split_at(dot),
        _ => (cleaned.as_str(), ""),
    };
    let ext_len = ext.chars().count();
    if ext_len >= MAX_NAME_CHARS {
        return cleaned.chars().take(MAX_NAME_CHARS).collect();
    }
    let stem: String = stem.chars().take(MAX_NAME_CHARS - ext_len).collect();
    format!("{stem}{ext}")
}

/// A user id as a single directory name, one-to-one with the id.
///
/// The `u` prefix keeps the empty id from naming the parent itself.
fn user_dir_name(user_id: &str) -> String {
    format!("u{}", URL_SAFE_NO_PAD.encode(user_id.as_bytes()))
}

fn storage_error(operation: &str, path: &Path, e: std::io::Error) -> RagError {
    RagError::StorageError {
        operation: operation.to_string(),
        message: format!("{}: {e}", path.display()),
    }
}

fn skip(warnings: &mut Vec<StoreWarning>, path: PathBuf, reason: String) {
    warn!(path = %path.display(), reason = %reason, "skipping unreadable record");
    warnings.push(StoreWarning { path, reason });
}

async fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

/// Paths of all `.json` records in `dir`, sorted by key.
async fn record_paths(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

async fn count_records(dir: &Path) -> usize {
    record_paths(dir).await.map(|paths| paths.len()).unwrap_or(0)
}

async fn read_record<R: Record>(path: &Path, warnings: &mut Vec<StoreWarning>) -> Option<R> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) => {
            skip(warnings, path.to_path_buf(), e.to_string());
            return None;
        }
    };
    let record: R = match serde_json::from_slice(&contents) {
        Ok(record) => record,
        Err(e) => {
            skip(warnings, path.to_path_buf(), format!("invalid record: {e}"));
            return None;
        }
    };
    if record.schema_version() != SCHEMA_VERSION {
        skip(
            warnings,
            path.to_path_buf(),
            format!(
                "unsupported schema version {}, expected {SCHEMA_VERSION}",
                record.schema_version()
            ),
        );
        return None;
    }
    Some(record)
}

async fn read_records<R: Record>(
    dir: &Path,
    warnings: &mut Vec<StoreWarning>,
) -> Vec<(PathBuf, R)> {
    let paths = match record_paths(dir).await {
        Ok(paths) => paths,
        Err(e) => {
            skip(warnings, dir.to_path_buf(), e.to_string());
            return Vec::new();
        }
    };
    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(record) = read_record(&path, warnings).await {
            records.push((path, record));
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("my notes (v2).txt"), "my_notes__v2_.txt");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("résumé.md"), "résumé.md");
    }

    #[test]
    fn sanitize_truncates_long_names_keeping_extension() {
        let long = format!("{}.markdown", "a".repeat(150));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.chars().count(), 100);
        assert!(sanitized.ends_with(".markdown"));
        assert!(sanitized.starts_with("aaaa"));
    }

    #[test]
    fn user_dir_names_are_distinct_and_stay_in_place() {
        let ids = ["", ".", "..", "a/b", "a_b", "a?b", "a b", "../x"];
        let names: std::collections::HashSet<String> =
            ids.iter().map(|id| user_dir_name(id)).collect();
        assert_eq!(names.len(), ids.len());
        for name in &names {
            assert!(name.starts_with('u'));
            assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_')));
        }
        assert_eq!(user_dir_name(""), "u");
    }

    #[test]
    fn long_ids_differing_at_the_end_get_different_dirs() {
        let a = format!("{}a", "x".repeat(100));
        let b = format!("{}b", "x".repeat(100));
        assert_ne!(user_dir_name(&a), user_dir_name(&b));
    }

    #[test]
    fn cosine_similarity_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }
}
