//! RAG system orchestrator.
//!
//! [`RagSystem`] is the façade a command surface talks to. It validates user
//! input before any remote call, then drives the ingest workflow
//! (decode → chunk → contextualize → embed → store) and the query workflow
//! through [`QueryEngine`]. Every operation returns a typed result whose
//! `Display` renders the text shown to the user.
//!
//! # Example
//!
//! ```rust,ignore
//! use contextual_rag::{BackendConfig, RagConfig, RagSystem};
//!
//! let system = RagSystem::from_backend_config(BackendConfig::from_env()?, RagConfig::default())?;
//!
//! let summary = system.ingest_bytes(&bytes, "notes.md", "user-1").await?;
//! println!("{summary}");
//! let answer = system.answer("What do the notes say about billing?", "user-1").await?;
//! println!("{answer}");
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::chunking::{Chunker, SentenceChunker};
#[cfg(feature = "openai")]
use crate::config::BackendConfig;
use crate::config::RagConfig;
use crate::contextualizer::Contextualizer;
use crate::document::{EmbeddedChunk, ProcessedDocument, QueryResponse};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::llm::CompletionProvider;
#[cfg(feature = "openai")]
use crate::openai::OpenAiCompatibleClient;
use crate::query::QueryEngine;
use crate::store::{DocumentStore, StoreRead, StoreWarning};

/// Longest accepted user id, which keeps its directory name under common
/// file-name limits.
const MAX_USER_ID_BYTES: usize = 128;

/// The document question-answering system.
///
/// Construct one via [`RagSystem::builder()`] or
/// [`RagSystem::from_backend_config`]. The system holds no per-user state,
/// so one instance can be shared behind an `Arc` across tasks.
pub struct RagSystem {
    config: RagConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn CompletionProvider>,
    chunker: Arc<dyn Chunker>,
    contextualizer: Contextualizer,
    store: DocumentStore,
    query_engine: QueryEngine,
    api_base: Option<String>,
}

impl RagSystem {
    /// Create a new [`RagSystemBuilder`].
    pub fn builder() -> RagSystemBuilder {
        RagSystemBuilder::default()
    }

    /// Wire one [`OpenAiCompatibleClient`] as both embedder and language model.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if the backend configuration is invalid.
    #[cfg(feature = "openai")]
    pub fn from_backend_config(backend: BackendConfig, config: RagConfig) -> Result<Self> {
        let api_base = backend.api_base.clone();
        let client = Arc::new(OpenAiCompatibleClient::new(backend)?);
        Self::builder()
            .config(config)
            .embedding_provider(client.clone())
            .completion_provider(client)
            .api_base(api_base)
            .build()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Return a reference to the document store.
    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Ingest an uploaded file for `user_id`.
    ///
    /// The extension, size and content are checked before any remote call.
    /// Bytes that are not valid UTF-8 are decoded as Latin-1.
    ///
    /// # Errors
    ///
    /// - [`RagError::ValidationError`] for a disallowed extension, an
    ///   oversized or blank file, or a blank user id
    /// - embedding errors from the provider, in which case nothing is stored
    /// - [`RagError::StorageError`] if the document cannot be written
    pub async fn ingest_bytes(
        &self,
        bytes: &[u8],
        filename: &str,
        user_id: &str,
    ) -> Result<IngestSummary> {
        validate_user(user_id)?;
        self.validate_upload(filename, bytes.len())?;
        self.ingest_validated(bytes, filename, user_id).await
    }

    /// Ingest a file from disk, stored under `filename`.
    ///
    /// The size is checked from file metadata before the file is read.
    ///
    /// # Errors
    ///
    /// As [`ingest_bytes`](Self::ingest_bytes), plus
    /// [`RagError::ValidationError`] if the file cannot be read.
    pub async fn ingest_file(
        &self,
        path: impl AsRef<Path>,
        filename: &str,
        user_id: &str,
    ) -> Result<IngestSummary> {
        let path = path.as_ref();
        validate_user(user_id)?;
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            RagError::ValidationError(format!("cannot read '{}': {e}", path.display()))
        })?;
        self.validate_upload(filename, usize::try_from(metadata.len()).unwrap_or(usize::MAX))?;

        let bytes = tokio::fs::read(path).await.map_err(|e| {
            RagError::ValidationError(format!("cannot read '{}': {e}", path.display()))
        })?;
        // The file may have grown between the metadata and the read.
        if bytes.len() > self.config.max_file_bytes {
            return Err(RagError::ValidationError(format!(
                "'{filename}' is {} bytes, the limit is {} bytes",
                bytes.len(),
                self.config.max_file_bytes
            )));
        }
        self.ingest_validated(&bytes, filename, user_id).await
    }

    /// Decode, process and store an upload whose user, name and size have
    /// already been checked.
    async fn ingest_validated(
        &self,
        bytes: &[u8],
        filename: &str,
        user_id: &str,
    ) -> Result<IngestSummary> {
        let text = decode_text(bytes);
        if text.trim().is_empty() {
            return Err(RagError::ValidationError(format!("document '{filename}' is empty")));
        }

        let document = self.process(&text, filename).await?;
        self.store.store(user_id, &document).await?;

        let summary = IngestSummary {
            filename: filename.to_string(),
            word_count: document.word_count(),
            chunk_count: document.chunks.len(),
        };
        info!(user_id, filename, chunk_count = summary.chunk_count, "ingested document");
        Ok(summary)
    }

    /// Answer `query` from the documents of `user_id`.
    ///
    /// A user without documents gets [`Answer::NoDocuments`] without any
    /// remote call being made.
    ///
    /// # Errors
    ///
    /// - [`RagError::ValidationError`] for a blank or overlong query, or a
    ///   blank user id
    /// - query embedding errors from the provider
    pub async fn answer(&self, query: &str, user_id: &str) -> Result<Answer> {
        validate_user(user_id)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::ValidationError("query cannot be empty".into()));
        }
        let length = query.chars().count();
        if length > self.config.max_query_chars {
            return Err(RagError::ValidationError(format!(
                "query is {length} characters long, the limit is {}",
                self.config.max_query_chars
            )));
        }

        if self.store.list_documents(user_id).await.value.is_empty() {
            debug!(user_id, "query from user without documents");
            return Ok(Answer::NoDocuments);
        }

        let outcome = self.query_engine.query(query, user_id).await.map_err(|e| {
            error!(user_id, error = %e, "query failed");
            e
        })?;
        if outcome.response.has_sources() {
            Ok(Answer::Found(outcome.response))
        } else {
            Ok(Answer::NotFound(outcome.response))
        }
    }

    /// List the documents of `user_id` in upload order.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ValidationError`] for an invalid user id.
    pub async fn list(&self, user_id: &str) -> Result<DocumentListing> {
        validate_user(user_id)?;
        let StoreRead { value, warnings } = self.store.list_documents(user_id).await;
        let documents = value
            .into_iter()
            .map(|doc| DocumentEntry {
                chunk_count: doc.chunks.len(),
                filename: doc.filename,
                uploaded_at: doc.upload_timestamp,
            })
            .collect();
        Ok(DocumentListing { documents, warnings })
    }

    /// The most recent document of `user_id` named `filename`, with full text.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ValidationError`] for an invalid user id.
    pub async fn get_document(
        &self,
        user_id: &str,
        filename: &str,
    ) -> Result<StoreRead<Option<ProcessedDocument>>> {
        validate_user(user_id)?;
        Ok(self.store.get_document(user_id, filename).await)
    }

    /// Remove every document of `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::StorageError`] if stored records cannot be removed.
    pub async fn clear(&self, user_id: &str) -> Result<ClearSummary> {
        validate_user(user_id)?;
        let removed = self.store.clear(user_id).await?;
        Ok(ClearSummary { removed })
    }

    /// Describe the models and storage the system is using.
    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            llm_model: self.llm.name().to_string(),
            embedding_model: self.embedder.name().to_string(),
            api_base: self.api_base.clone(),
            storage_path: self.store.base_path().to_path_buf(),
        }
    }

    fn validate_upload(&self, filename: &str, size: usize) -> Result<()> {
        if filename.trim().is_empty() {
            return Err(RagError::ValidationError("filename cannot be empty".into()));
        }
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.config.allowed_extensions.iter().any(|allowed| *allowed == extension) {
            return Err(RagError::ValidationError(format!(
                "unsupported file type for '{filename}', allowed: {}",
                self.config.allowed_extensions.join(", ")
            )));
        }
        if size > self.config.max_file_bytes {
            return Err(RagError::ValidationError(format!(
                "'{filename}' is {size} bytes, the limit is {} bytes",
                self.config.max_file_bytes
            )));
        }
        Ok(())
    }

    /// Chunk, contextualize and embed `text` into a [`ProcessedDocument`].
    async fn process(&self, text: &str, filename: &str) -> Result<ProcessedDocument> {
        let chunks = self.chunker.chunk(text);
        if chunks.is_empty() {
            return Err(RagError::ValidationError(format!("document '{filename}' is empty")));
        }

        let contextual = self.contextualizer.contextualize(&chunks, filename, text).await?;

        let texts: Vec<&str> = contextual.iter().map(|c| c.contextual_text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await.map_err(|e| {
            error!(filename, error = %e, "embedding failed during ingestion");
            e
        })?;
        if embeddings.len() != contextual.len() {
            return Err(RagError::EmbeddingError {
                provider: self.embedder.name().to_string(),
                message: format!(
                    "expected {} embeddings for '{filename}', got {}",
                    contextual.len(),
                    embeddings.len()
                ),
            });
        }

        let embedded = contextual
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| EmbeddedChunk::new(chunk, embedding))
            .collect::<Result<Vec<_>>>()?;

        ProcessedDocument::new(filename, text, embedded, Utc::now())
    }
}

/// Decode upload bytes as UTF-8, falling back to Latin-1.
///
/// Latin-1 maps every byte to a character, so decoding never fails.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            debug!("upload is not valid UTF-8, decoding as Latin-1");
            bytes.iter().map(|&b| char::from(b)).collect()
        }
    }
}

fn validate_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(RagError::ValidationError("user id cannot be empty".into()));
    }
    if user_id.len() > MAX_USER_ID_BYTES {
        return Err(RagError::ValidationError(format!(
            "user id is {} bytes long, the limit is {MAX_USER_ID_BYTES}",
            user_id.len()
        )));
    }
    Ok(())
}

/// Builder for constructing a [`RagSystem`].
///
/// The embedding and completion providers are required. The configuration
/// defaults to [`RagConfig::default()`], the store to one rooted at the
/// configured storage path, and the chunker to a [`SentenceChunker`] using
/// the configured sizes.
#[derive(Default)]
pub struct RagSystemBuilder {
    config: Option<RagConfig>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    llm: Option<Arc<dyn CompletionProvider>>,
    chunker: Option<Arc<dyn Chunker>>,
    store: Option<DocumentStore>,
    api_base: Option<String>,
}

impl RagSystemBuilder {
    /// Set the pipeline configuration.
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(provider);
        self
    }

    /// Set the language model used for contexts and answers.
    pub fn completion_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.llm = Some(provider);
        self
    }

    /// Set the document chunker.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Set the document store.
    pub fn store(mut self, store: DocumentStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the API base reported by [`RagSystem::status`].
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    /// Build the [`RagSystem`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if a provider is missing.
    pub fn build(self) -> Result<RagSystem> {
        let config = self.config.unwrap_or_default();
        let embedder = self
            .embedder
            .ok_or_else(|| RagError::ConfigError("embedding_provider is required".to_string()))?;
        let llm = self
            .llm
            .ok_or_else(|| RagError::ConfigError("completion_provider is required".to_string()))?;
        let chunker =
            self.chunker.unwrap_or_else(|| Arc::new(SentenceChunker::from_config(&config)));
        let store = self.store.unwrap_or_else(|| DocumentStore::from_config(&config));

        let contextualizer = Contextualizer::new(
            llm.clone(),
            config.context_preview_chars,
            config.context_concurrency,
        );
        let query_engine = QueryEngine::new(embedder.clone(), llm.clone(), store.clone(), &config);

        Ok(RagSystem {
            config,
            embedder,
            llm,
            chunker,
            contextualizer,
            store,
            query_engine,
            api_base: self.api_base,
        })
    }
}

/// The outcome of a successful ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    /// Name the document was stored under.
    pub filename: String,
    /// Whitespace-separated words in the decoded text.
    pub word_count: usize,
    /// Chunks that were embedded and stored.
    pub chunk_count: usize,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Document processed successfully!")?;
        writeln!(f)?;
        writeln!(f, "File: {}", self.filename)?;
        writeln!(f, "Size: {} words", self.word_count)?;
        writeln!(f, "Chunks: {} chunks created", self.chunk_count)?;
        write!(f, "Status: Ready for querying")
    }
}

/// The result of asking a question.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// The user has not uploaded anything yet.
    NoDocuments,
    /// An answer backed by at least one source chunk.
    Found(QueryResponse),
    /// Documents exist but none were relevant.
    NotFound(QueryResponse),
}

impl Answer {
    /// The underlying response, if the query reached the engine.
    pub fn response(&self) -> Option<&QueryResponse> {
        match self {
            Answer::NoDocuments => None,
            Answer::Found(response) | Answer::NotFound(response) => Some(response),
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::NoDocuments => write!(
                f,
                "No documents found!\n\nYou haven't uploaded any documents yet. \
                 Upload a text file first."
            ),
            Answer::Found(response) => write!(
                f,
                "Query Response (Confidence: {:.1}%)\n\n{}",
                response.confidence_score * 100.0,
                response.answer
            ),
            Answer::NotFound(response) => f.write_str(&response.answer),
        }
    }
}

/// One line of a [`DocumentListing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    /// Name given at upload.
    pub filename: String,
    /// When the document was processed.
    pub uploaded_at: DateTime<Utc>,
    /// Number of stored chunks.
    pub chunk_count: usize,
}

/// A user's documents in upload order, with any records that were skipped.
#[derive(Debug, Clone)]
pub struct DocumentListing {
    /// Documents, oldest first.
    pub documents: Vec<DocumentEntry>,
    /// Records that could not be read.
    pub warnings: Vec<StoreWarning>,
}

impl fmt::Display for DocumentListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Your Document Collection")?;
        writeln!(f)?;
        if self.documents.is_empty() {
            return write!(f, "No documents uploaded yet.");
        }
        for (i, doc) in self.documents.iter().enumerate() {
            writeln!(f, "{}. {}", i + 1, doc.filename)?;
            writeln!(f, "   Uploaded: {}", doc.uploaded_at.format("%Y-%m-%d %H:%M"))?;
            writeln!(f, "   Chunks: {}", doc.chunk_count)?;
        }
        write!(f, "\nTotal: {}", plural(self.documents.len(), "document"))?;
        if !self.warnings.is_empty() {
            write!(f, "\n{} could not be read", plural(self.warnings.len(), "record"))?;
        }
        Ok(())
    }
}

/// The outcome of clearing a user's documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearSummary {
    /// Number of documents deleted; zero when there was nothing to clear.
    pub removed: usize,
}

impl fmt::Display for ClearSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.removed == 0 {
            return write!(f, "No documents to clear. Your document collection is already empty.");
        }
        write!(
            f,
            "Documents cleared successfully!\n\nRemoved {} from your collection.",
            plural(self.removed, "document")
        )
    }
}

/// The models and storage a [`RagSystem`] is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStatus {
    /// Model used for context generation and answers.
    pub llm_model: String,
    /// Model used for embeddings.
    pub embedding_model: String,
    /// Backend URL, when the system was built from a backend config.
    pub api_base: Option<String>,
    /// Root directory of the document store.
    pub storage_path: PathBuf,
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RAG System Status")?;
        writeln!(f)?;
        writeln!(f, "LLM Model: {}", self.llm_model)?;
        writeln!(f, "Embedding Model: {}", self.embedding_model)?;
        writeln!(f, "API Base: {}", self.api_base.as_deref().unwrap_or("(not configured)"))?;
        write!(f, "Storage Path: {}", self.storage_path.display())
    }
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 { format!("{count} {noun}") } else { format!("{count} {noun}s") }
}
