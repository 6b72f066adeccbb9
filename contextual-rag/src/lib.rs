//! # contextual-rag
//!
//! Per-user document question answering with contextual retrieval.
//!
//! Users upload plain-text documents and later ask questions answered from
//! them. Each document is split into overlapping chunks, every chunk is
//! prefixed with a model-written context that situates it within the whole
//! document, and the result is embedded and stored per user. Questions are
//! embedded, matched against the user's chunks by cosine similarity, and
//! answered by a language model from the best matches with a confidence
//! score.
//!
//! A session-scoped image chat ([`vision`]) is provided alongside.
//!
//! ## Architecture
//!
//! - [`EmbeddingProvider`], [`CompletionProvider`] and [`ChatModel`] are the
//!   seams to remote models; [`OpenAiCompatibleClient`] implements all three
//!   against any OpenAI-compatible API.
//! - [`SentenceChunker`] splits text, [`Contextualizer`] adds context.
//! - [`DocumentStore`] persists documents as versioned JSON and searches them.
//! - [`QueryEngine`] retrieves, filters and synthesizes answers.
//! - [`RagSystem`] validates input and ties everything together.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use contextual_rag::{BackendConfig, RagConfig, RagSystem};
//!
//! contextual_rag::telemetry::init_tracing();
//! let system = RagSystem::from_backend_config(BackendConfig::from_env()?, RagConfig::default())?;
//!
//! system.ingest_file("handbook.md", "handbook.md", "user-1").await?;
//! println!("{}", system.answer("How many vacation days do I get?", "user-1").await?);
//! ```

pub mod chunking;
pub mod config;
pub mod contextualizer;
pub mod document;
pub mod embedding;
pub mod error;
pub mod llm;
#[cfg(feature = "openai")]
pub mod openai;
pub mod pipeline;
pub mod query;
pub mod store;
pub mod telemetry;
pub mod vision;

pub use chunking::{Chunker, SentenceChunker};
pub use config::{BackendConfig, RagConfig, RagConfigBuilder};
pub use contextualizer::Contextualizer;
pub use document::{ContextualChunk, EmbeddedChunk, ProcessedDocument, QueryResponse, RelevantChunk};
pub use embedding::EmbeddingProvider;
pub use error::{RagError, Result};
pub use llm::{ChatMessage, ChatModel, ChatOptions, CompletionProvider, ContentPart, Role};
#[cfg(feature = "openai")]
pub use openai::OpenAiCompatibleClient;
pub use pipeline::{
    Answer, ClearSummary, DocumentEntry, DocumentListing, IngestSummary, RagSystem,
    RagSystemBuilder, SystemStatus,
};
pub use query::{QueryEngine, QueryOutcome};
pub use store::{DocumentStore, StoreRead, StoreWarning};
pub use vision::{ImageChat, SessionCache};
