//! Query execution: retrieve, filter, synthesize, score.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RagConfig;
use crate::document::{QueryResponse, RelevantChunk};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::llm::CompletionProvider;
use crate::store::{DocumentStore, StoreWarning};

/// Answers a question from one user's stored documents.
///
/// Retrieval asks the store for `2 * max_context_chunks` candidates, keeps
/// those scoring at least `min_similarity_threshold`, and passes at most
/// `max_context_chunks` of them to the model.
pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn CompletionProvider>,
    store: DocumentStore,
    max_context_chunks: usize,
    min_similarity_threshold: f32,
}

/// A [`QueryResponse`] with the store records skipped while producing it.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// The answer, its sources and confidence.
    pub response: QueryResponse,
    /// Records skipped by the search.
    pub warnings: Vec<StoreWarning>,
}

impl QueryEngine {
    /// Create an engine searching `store`, taking its limits from `config`.
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn CompletionProvider>,
        store: DocumentStore,
        config: &RagConfig,
    ) -> Self {
        Self {
            embedder,
            llm,
            store,
            max_context_chunks: config.max_context_chunks,
            min_similarity_threshold: config.min_similarity_threshold,
        }
    }

    /// Answer `query` from the documents of `user_id`.
    ///
    /// A failed answer call does not fail the query: the error text takes the
    /// place of the answer and the sources are still listed.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ValidationError`] for a blank query, before any
    /// remote call. Query embedding failures propagate unchanged.
    pub async fn query(&self, query: &str, user_id: &str) -> Result<QueryOutcome> {
        if query.trim().is_empty() {
            return Err(RagError::ValidationError("query cannot be empty".into()));
        }

        let query_embedding = self.embedder.embed(query).await?;
        let (chunks, warnings) = self.retrieve(&query_embedding, user_id).await;

        if chunks.is_empty() {
            info!(user_id, "no relevant chunks for query");
            let response = QueryResponse::new(no_results_answer(query), Vec::new(), 0.0)?;
            return Ok(QueryOutcome { response, warnings });
        }

        let answer = self.synthesize(query, &chunks).await;
        let confidence = confidence_score(&chunks);
        info!(user_id, source_count = chunks.len(), confidence, "answered query");

        let response = QueryResponse::new(answer, chunks, confidence)?;
        Ok(QueryOutcome { response, warnings })
    }

    async fn retrieve(
        &self,
        query_embedding: &[f32],
        user_id: &str,
    ) -> (Vec<RelevantChunk>, Vec<StoreWarning>) {
        let read = self.store.search(query_embedding, user_id, self.max_context_chunks * 2).await;
        let threshold = self.min_similarity_threshold;
        let mut chunks: Vec<RelevantChunk> =
            read.value.into_iter().filter(|c| c.similarity_score >= threshold).collect();
        chunks.truncate(self.max_context_chunks);
        (chunks, read.warnings)
    }

    async fn synthesize(&self, query: &str, chunks: &[RelevantChunk]) -> String {
        let sources = sources_block(chunks);
        match self.llm.complete(&answer_prompt(query, chunks)).await {
            Ok(reply) if !reply.trim().is_empty() => {
                format!("{}\n\nSources:\n{sources}", reply.trim())
            }
            Ok(_) => {
                warn!("model returned an empty answer");
                format!(
                    "I found relevant information in your documents, but the model returned \
                     an empty answer.\n\nSources:\n{sources}"
                )
            }
            Err(e) => {
                warn!(error = %e, "answer generation failed");
                format!(
                    "I found relevant information in your documents, but encountered an error \
                     generating the response: {e}\n\nSources:\n{sources}"
                )
            }
        }
    }
}

/// Confidence in an answer drawn from `chunks`.
///
/// The mean similarity is stretched in the middle range and compressed at
/// the top, since cosine similarity rarely approaches 1.0 for natural text:
///
/// | mean          | confidence                 |
/// |---------------|----------------------------|
/// | `>= 0.8`      | `0.8 + (mean - 0.8) * 0.5` |
/// | `0.4 ..< 0.8` | `0.4 + (mean - 0.4)`       |
/// | `< 0.4`       | `mean`                     |
///
/// The result is within `[0.0, 1.0]`; no chunks gives 0.0.
pub fn confidence_score(chunks: &[RelevantChunk]) -> f32 {
    if chunks.is_empty() {
        return 0.0;
    }
    let mean = chunks.iter().map(|c| c.similarity_score).sum::<f32>() / chunks.len() as f32;
    let scaled = if mean >= 0.8 {
        0.8 + (mean - 0.8) * 0.5
    } else if mean >= 0.4 {
        0.4 + (mean - 0.4)
    } else {
        mean
    };
    scaled.clamp(0.0, 1.0)
}

/// The answer given when no stored chunk is relevant enough.
pub fn no_results_answer(query: &str) -> String {
    format!(
        "I couldn't find any relevant information in your uploaded documents to answer: \"{query}\"\n\n\
         This could mean:\n\
         - You haven't uploaded any documents yet\n\
         - Your documents don't contain information related to this question\n\
         - Try rephrasing your question or using different keywords"
    )
}

fn answer_prompt(query: &str, chunks: &[RelevantChunk]) -> String {
    let context = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("[Context {}]: {}", i + 1, chunk.original_text()))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Based on the following context from uploaded documents, please answer the user's \
         question. If the context doesn't contain enough information to answer the question, \
         say so clearly.\n\n\
         Context:\n{context}\n\n\
         Question: {query}\n\n\
         Please provide a helpful and accurate answer based on the context above. If you \
         reference specific information, mention which document it came from."
    )
}

fn sources_block(chunks: &[RelevantChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("- {} (similarity: {:.2})", c.document_filename(), c.similarity_score))
        .collect::<Vec<_>>()
        .join("\n")
}
