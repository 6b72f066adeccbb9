//! Contextual retrieval: situating each chunk within its document.
//!
//! Before embedding, every chunk is prefixed with a short model-written
//! sentence describing where it sits in the document. Context generation is
//! best effort: a failed call falls back to a fixed sentence naming the file,
//! so ingestion never stops because of it.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::document::ContextualChunk;
use crate::error::Result;
use crate::llm::CompletionProvider;

/// Generates a situating context for each chunk of a document.
///
/// # Example
///
/// ```rust,ignore
/// let contextualizer = Contextualizer::new(llm, 2000, 4);
/// let chunks = contextualizer.contextualize(&raw_chunks, "notes.txt", &text).await?;
/// ```
pub struct Contextualizer {
    llm: Arc<dyn CompletionProvider>,
    preview_chars: usize,
    concurrency: usize,
}

impl Contextualizer {
    /// Create a contextualizer.
    ///
    /// # Arguments
    ///
    /// * `preview_chars`: how much of the document the model sees per call
    /// * `concurrency`: maximum number of context calls in flight
    pub fn new(llm: Arc<dyn CompletionProvider>, preview_chars: usize, concurrency: usize) -> Self {
        Self { llm, preview_chars, concurrency: concurrency.max(1) }
    }

    /// Produce one [`ContextualChunk`] per input chunk, in input order.
    ///
    /// Chunk indices are assigned from the input position. Remote failures
    /// never surface here; they degrade to [`fallback_context`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvariantViolation`] only if a chunk or the
    /// filename is blank.
    pub async fn contextualize(
        &self,
        chunks: &[String],
        filename: &str,
        full_text: &str,
    ) -> Result<Vec<ContextualChunk>> {
        let preview = document_preview(full_text, self.preview_chars);

        let contexts: Vec<Option<String>> = stream::iter(chunks.iter().enumerate())
            .map(|(index, chunk)| self.context_for(index, chunk, filename, &preview))
            .buffered(self.concurrency)
            .collect()
            .await;

        let fallbacks = contexts.iter().filter(|c| c.is_none()).count();
        debug!(filename, chunk_count = chunks.len(), fallbacks, "contextualized chunks");

        chunks
            .iter()
            .zip(contexts)
            .enumerate()
            .map(|(index, (chunk, context))| {
                let context = context.unwrap_or_else(|| fallback_context(filename));
                ContextualChunk::with_context(&context, chunk.as_str(), index, filename)
            })
            .collect()
    }

    /// Ask the model for a context; `None` means the fallback applies.
    async fn context_for(
        &self,
        index: usize,
        chunk: &str,
        filename: &str,
        preview: &str,
    ) -> Option<String> {
        let prompt = context_prompt(preview, chunk);
        match self.llm.complete(&prompt).await {
            Ok(reply) if !reply.trim().is_empty() => Some(reply.trim().to_string()),
            Ok(_) => {
                warn!(filename, chunk_index = index, "empty context from model, using fallback");
                None
            }
            Err(e) => {
                warn!(filename, chunk_index = index, error = %e, "context generation failed, using fallback");
                None
            }
        }
    }
}

/// The context used when the model cannot provide one.
pub fn fallback_context(filename: &str) -> String {
    format!("This chunk is from the document '{filename}'.")
}

/// The first `max_chars` characters of the document, with `...` appended if cut.
pub fn document_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &text[..byte_index]),
        None => text.to_string(),
    }
}

fn context_prompt(preview: &str, chunk: &str) -> String {
    format!(
        "<document>\n{preview}\n</document>\n\n\
         Here is the chunk we want to situate within the whole document:\n\
         <chunk>\n{chunk}\n</chunk>\n\n\
         Please give a short succinct context to situate this chunk within the overall \
         document for the purposes of improving search retrieval of the chunk. \
         Answer only with the context, nothing else."
    )
}
