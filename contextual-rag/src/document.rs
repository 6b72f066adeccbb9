//! Data types for processed documents, chunks, and query results.
//!
//! Every type is constructed through a validating `new` that rejects values
//! breaking the data-model invariants with [`RagError::InvariantViolation`].
//! Fields stay public for reading; deserialized values are re-validated by the
//! store before use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// A chunk of a document with a model-generated context prepended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextualChunk {
    /// The chunk text exactly as cut from the document.
    pub original_text: String,
    /// The generated context, a single space, then `original_text`.
    pub contextual_text: String,
    /// Position of the chunk within its document, starting at 0.
    pub chunk_index: usize,
    /// Filename of the document the chunk came from.
    pub document_filename: String,
}

impl ContextualChunk {
    /// Create a contextual chunk.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvariantViolation`] if any text field is blank.
    pub fn new(
        original_text: impl Into<String>,
        contextual_text: impl Into<String>,
        chunk_index: usize,
        document_filename: impl Into<String>,
    ) -> Result<Self> {
        let chunk = Self {
            original_text: original_text.into(),
            contextual_text: contextual_text.into(),
            chunk_index,
            document_filename: document_filename.into(),
        };
        chunk.validate()?;
        Ok(chunk)
    }

    /// Build the chunk by prepending `context` to `original_text`.
    pub fn with_context(
        context: &str,
        original_text: impl Into<String>,
        chunk_index: usize,
        document_filename: impl Into<String>,
    ) -> Result<Self> {
        let original_text = original_text.into();
        let contextual_text = format!("{context} {original_text}");
        Self::new(original_text, contextual_text, chunk_index, document_filename)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.original_text.trim().is_empty() {
            return Err(RagError::InvariantViolation("original text cannot be empty".into()));
        }
        if self.contextual_text.trim().is_empty() {
            return Err(RagError::InvariantViolation("contextual text cannot be empty".into()));
        }
        if self.document_filename.trim().is_empty() {
            return Err(RagError::InvariantViolation("document filename cannot be empty".into()));
        }
        Ok(())
    }
}

/// A [`ContextualChunk`] paired with the embedding of its contextual text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedChunk {
    /// The chunk that was embedded.
    pub contextual_chunk: ContextualChunk,
    /// The embedding vector.
    pub embedding: Vec<f32>,
}

impl EmbeddedChunk {
    /// Attach an embedding to a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvariantViolation`] if the embedding is empty or
    /// contains a non-finite value.
    pub fn new(contextual_chunk: ContextualChunk, embedding: Vec<f32>) -> Result<Self> {
        let chunk = Self { contextual_chunk, embedding };
        chunk.validate()?;
        Ok(chunk)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.contextual_chunk.validate()?;
        if self.embedding.is_empty() {
            return Err(RagError::InvariantViolation("embedding cannot be empty".into()));
        }
        if self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(RagError::InvariantViolation(
                "embedding must contain only finite values".into(),
            ));
        }
        Ok(())
    }
}

/// A fully ingested document: chunked, contextualized and embedded.
///
/// Documents are immutable once created. Uploading the same filename again
/// creates a second, independent document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedDocument {
    /// The filename supplied at upload time.
    pub filename: String,
    /// The full document text.
    pub original_text: String,
    /// Embedded chunks in chunking order.
    pub chunks: Vec<EmbeddedChunk>,
    /// When the document was ingested.
    pub upload_timestamp: DateTime<Utc>,
}

impl ProcessedDocument {
    /// Create a processed document.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvariantViolation`] if the filename or text is
    /// blank, there are no chunks, chunk indices are not strictly increasing,
    /// or chunk embeddings differ in dimensionality.
    pub fn new(
        filename: impl Into<String>,
        original_text: impl Into<String>,
        chunks: Vec<EmbeddedChunk>,
        upload_timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let document = Self {
            filename: filename.into(),
            original_text: original_text.into(),
            chunks,
            upload_timestamp,
        };
        document.validate()?;
        Ok(document)
    }

    /// Dimensionality shared by every chunk embedding.
    pub fn embedding_dimensions(&self) -> usize {
        self.chunks.first().map(|c| c.embedding.len()).unwrap_or(0)
    }

    /// Number of whitespace-separated words in the original text.
    pub fn word_count(&self) -> usize {
        self.original_text.split_whitespace().count()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.filename.trim().is_empty() {
            return Err(RagError::InvariantViolation("filename cannot be empty".into()));
        }
        if self.original_text.trim().is_empty() {
            return Err(RagError::InvariantViolation("original text cannot be empty".into()));
        }
        if self.chunks.is_empty() {
            return Err(RagError::InvariantViolation(
                "document must have at least one chunk".into(),
            ));
        }
        let dimensions = self.embedding_dimensions();
        let mut previous_index: Option<usize> = None;
        for chunk in &self.chunks {
            chunk.validate()?;
            if chunk.embedding.len() != dimensions {
                return Err(RagError::InvariantViolation(format!(
                    "chunk {} has {} embedding dimensions, expected {dimensions}",
                    chunk.contextual_chunk.chunk_index,
                    chunk.embedding.len()
                )));
            }
            let index = chunk.contextual_chunk.chunk_index;
            if previous_index.is_some_and(|prev| index <= prev) {
                return Err(RagError::InvariantViolation(format!(
                    "chunk indices must be strictly increasing, found {index} after {}",
                    previous_index.unwrap_or_default()
                )));
            }
            previous_index = Some(index);
        }
        Ok(())
    }
}

/// A retrieved [`EmbeddedChunk`] paired with its similarity to the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelevantChunk {
    /// The retrieved chunk.
    pub chunk: EmbeddedChunk,
    /// Cosine similarity to the query, within `[0.0, 1.0]`.
    pub similarity_score: f32,
}

impl RelevantChunk {
    /// Pair a chunk with its similarity score.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvariantViolation`] if the score is outside
    /// `[0.0, 1.0]` or NaN.
    pub fn new(chunk: EmbeddedChunk, similarity_score: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&similarity_score) {
            return Err(RagError::InvariantViolation(format!(
                "similarity score must be between 0.0 and 1.0, got {similarity_score}"
            )));
        }
        Ok(Self { chunk, similarity_score })
    }

    /// Filename of the document the chunk came from.
    pub fn document_filename(&self) -> &str {
        &self.chunk.contextual_chunk.document_filename
    }

    /// The chunk text without its generated context.
    pub fn original_text(&self) -> &str {
        &self.chunk.contextual_chunk.original_text
    }
}

/// The answer to a user query along with the chunks it was drawn from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    /// The answer text, never blank.
    pub answer: String,
    /// Chunks used as context. Empty when nothing relevant was found.
    pub source_chunks: Vec<RelevantChunk>,
    /// Confidence in the answer, within `[0.0, 1.0]`.
    pub confidence_score: f32,
}

impl QueryResponse {
    /// Create a query response.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvariantViolation`] if the answer is blank or the
    /// confidence is outside `[0.0, 1.0]`.
    pub fn new(
        answer: impl Into<String>,
        source_chunks: Vec<RelevantChunk>,
        confidence_score: f32,
    ) -> Result<Self> {
        let answer = answer.into();
        if answer.trim().is_empty() {
            return Err(RagError::InvariantViolation("answer cannot be empty".into()));
        }
        if !(0.0..=1.0).contains(&confidence_score) {
            return Err(RagError::InvariantViolation(format!(
                "confidence score must be between 0.0 and 1.0, got {confidence_score}"
            )));
        }
        Ok(Self { answer, source_chunks, confidence_score })
    }

    /// Whether any document content backed the answer.
    pub fn has_sources(&self) -> bool {
        !self.source_chunks.is_empty()
    }
}
