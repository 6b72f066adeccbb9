//! Configuration for the remote backend and the RAG pipeline.
//!
//! [`BackendConfig`] holds the connection settings for the OpenAI-compatible
//! embedding and chat endpoints. [`RagConfig`] holds the pipeline tunables
//! (chunking, retrieval thresholds, input limits, storage location) and is
//! constructed through a validating [`RagConfigBuilder`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Environment variable holding the API base URL.
pub const ENV_API_BASE: &str = "OPENROUTER_API_BASE";
/// Environment variable holding the API key.
pub const ENV_API_KEY: &str = "OPENROUTER_API_KEY";
/// Environment variable holding the embedding model name.
pub const ENV_EMBED_MODEL: &str = "OPENROUTER_EMBED_MODEL";
/// Environment variable holding the chat model name.
pub const ENV_LLM_MODEL: &str = "OPENROUTER_MODEL";
/// Optional environment variable holding the vision model name.
pub const ENV_VISION_MODEL: &str = "OPENROUTER_VISION_MODEL";
/// Optional environment variable holding the request timeout in seconds.
pub const ENV_TIMEOUT_SECS: &str = "OPENROUTER_TIMEOUT_SECS";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Connection settings for an OpenAI-compatible backend.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Base URL of the API, e.g. `https://openrouter.ai/api/`.
    pub api_base: String,
    /// Bearer token sent with every request.
    pub api_key: String,
    /// Model used for embeddings.
    pub embedding_model: String,
    /// Model used for context generation and answer synthesis.
    pub llm_model: String,
    /// Model used for image chat. Falls back to `llm_model` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_model: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Maximum number of texts per embedding request.
    pub embed_batch_size: usize,
    /// Sampling temperature for text completions.
    pub temperature: f32,
    /// Maximum tokens generated per text completion.
    pub max_tokens: u32,
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .field("embedding_model", &self.embedding_model)
            .field("llm_model", &self.llm_model)
            .field("vision_model", &self.vision_model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("embed_batch_size", &self.embed_batch_size)
            .finish()
    }
}

impl BackendConfig {
    /// Create a config with the default timeout, batch size and sampling settings.
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        embedding_model: impl Into<String>,
        llm_model: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            embedding_model: embedding_model.into(),
            llm_model: llm_model.into(),
            vision_model: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            embed_batch_size: 10,
            temperature: 0.1,
            max_tokens: 2048,
        }
    }

    /// Load the config from `OPENROUTER_*` environment variables.
    ///
    /// A `.env` file in the working directory is read first if present.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] listing every missing required variable,
    /// or if `OPENROUTER_TIMEOUT_SECS` is not a positive integer.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine; the process environment still applies.
        let _ = dotenvy::dotenv();

        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let api_base = read(ENV_API_BASE);
        let api_key = read(ENV_API_KEY);
        let embedding_model = read(ENV_EMBED_MODEL);
        let llm_model = read(ENV_LLM_MODEL);

        let missing: Vec<&str> = [
            (ENV_API_BASE, api_base.is_none()),
            (ENV_API_KEY, api_key.is_none()),
            (ENV_EMBED_MODEL, embedding_model.is_none()),
            (ENV_LLM_MODEL, llm_model.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        let (Some(api_base), Some(api_key), Some(embedding_model), Some(llm_model)) =
            (api_base, api_key, embedding_model, llm_model)
        else {
            return Err(RagError::ConfigError(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        };

        let mut config = Self::new(api_base, api_key, embedding_model, llm_model);
        config.vision_model = read(ENV_VISION_MODEL);
        if let Some(raw) = read(ENV_TIMEOUT_SECS) {
            config.request_timeout_secs = raw.trim().parse().map_err(|_| {
                RagError::ConfigError(format!("{ENV_TIMEOUT_SECS} must be a positive integer, got '{raw}'"))
            })?;
        }
        Ok(config)
    }

    /// Set the model used for image chat.
    pub fn with_vision_model(mut self, model: impl Into<String>) -> Self {
        self.vision_model = Some(model.into());
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the maximum number of texts sent per embedding request.
    pub fn with_embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = size;
        self
    }

    /// The per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The model used for image chat.
    pub fn vision_model(&self) -> &str {
        self.vision_model.as_deref().unwrap_or(&self.llm_model)
    }

    /// Build the full URL for an API path such as `embeddings`.
    ///
    /// The `v1` segment is appended unless the base already ends with it.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.api_base.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/{path}")
        } else {
            format!("{base}/v1/{path}")
        }
    }

    /// Validate the connection settings.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if:
    /// - `api_base` is not an `http://` or `https://` URL
    /// - `api_key` does not start with `sk-`
    /// - either model name is empty
    /// - the timeout or embedding batch size is zero
    pub fn validate(&self) -> Result<()> {
        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err(RagError::ConfigError(format!("{ENV_API_BASE} must be a valid URL")));
        }
        if !self.api_key.starts_with("sk-") {
            return Err(RagError::ConfigError(format!("{ENV_API_KEY} must start with 'sk-'")));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(RagError::ConfigError(format!("{ENV_EMBED_MODEL} cannot be empty")));
        }
        if self.llm_model.trim().is_empty() {
            return Err(RagError::ConfigError(format!("{ENV_LLM_MODEL} cannot be empty")));
        }
        if self.request_timeout_secs == 0 {
            return Err(RagError::ConfigError("request timeout must be greater than zero".into()));
        }
        if self.embed_batch_size == 0 {
            return Err(RagError::ConfigError(
                "embed_batch_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration parameters for the RAG pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagConfig {
    /// Target maximum chunk size in characters.
    pub chunk_size: usize,
    /// Number of overlapping characters between consecutive chunks.
    pub chunk_overlap: usize,
    /// How many characters of the document are shown to the model when
    /// generating per-chunk context.
    pub context_preview_chars: usize,
    /// Maximum number of concurrent context-generation calls per document.
    pub context_concurrency: usize,
    /// Maximum number of chunks placed into the answer prompt.
    pub max_context_chunks: usize,
    /// Minimum similarity a chunk needs to be used as answer context.
    pub min_similarity_threshold: f32,
    /// Hard floor applied by the store's search; scores at or below it are discarded.
    pub search_floor: f32,
    /// Largest accepted upload in bytes.
    pub max_file_bytes: usize,
    /// Longest accepted query in characters.
    pub max_query_chars: usize,
    /// Accepted upload extensions, lowercase and without the dot.
    pub allowed_extensions: Vec<String>,
    /// Root directory of the document store.
    pub storage_path: PathBuf,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            context_preview_chars: 2000,
            context_concurrency: 4,
            max_context_chunks: 5,
            min_similarity_threshold: 0.2,
            search_floor: 0.1,
            max_file_bytes: 10 * 1024 * 1024,
            max_query_chars: 1000,
            allowed_extensions: ["txt", "md", "markdown", "text"]
                .into_iter()
                .map(String::from)
                .collect(),
            storage_path: PathBuf::from("./filestore"),
        }
    }
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }

    /// Number of candidates requested from the store before threshold filtering.
    pub fn search_top_k(&self) -> usize {
        self.max_context_chunks * 2
    }
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Set the target chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in characters.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set how much of the document is shown to the model per context call.
    pub fn context_preview_chars(mut self, chars: usize) -> Self {
        self.config.context_preview_chars = chars;
        self
    }

    /// Set the number of concurrent context-generation calls.
    pub fn context_concurrency(mut self, concurrency: usize) -> Self {
        self.config.context_concurrency = concurrency;
        self
    }

    /// Set the maximum number of chunks used as answer context.
    pub fn max_context_chunks(mut self, chunks: usize) -> Self {
        self.config.max_context_chunks = chunks;
        self
    }

    /// Set the minimum similarity for answer context.
    pub fn min_similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.min_similarity_threshold = threshold;
        self
    }

    /// Set the store-level search floor.
    pub fn search_floor(mut self, floor: f32) -> Self {
        self.config.search_floor = floor;
        self
    }

    /// Set the largest accepted upload in bytes.
    pub fn max_file_bytes(mut self, bytes: usize) -> Self {
        self.config.max_file_bytes = bytes;
        self
    }

    /// Set the longest accepted query in characters.
    pub fn max_query_chars(mut self, chars: usize) -> Self {
        self.config.max_query_chars = chars;
        self
    }

    /// Replace the accepted upload extensions.
    pub fn allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    /// Set the root directory of the document store.
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = path.into();
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if:
    /// - `chunk_size == 0` or `chunk_overlap >= chunk_size`
    /// - `context_preview_chars`, `context_concurrency`, `max_context_chunks`,
    ///   `max_file_bytes` or `max_query_chars` is zero
    /// - either similarity threshold lies outside `[0.0, 1.0]`
    /// - no upload extension is allowed
    pub fn build(self) -> Result<RagConfig> {
        let c = &self.config;
        if c.chunk_size == 0 {
            return Err(RagError::ConfigError("chunk_size must be greater than zero".into()));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(RagError::ConfigError(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                c.chunk_overlap, c.chunk_size
            )));
        }
        for (name, value) in [
            ("context_preview_chars", c.context_preview_chars),
            ("context_concurrency", c.context_concurrency),
            ("max_context_chunks", c.max_context_chunks),
            ("max_file_bytes", c.max_file_bytes),
            ("max_query_chars", c.max_query_chars),
        ] {
            if value == 0 {
                return Err(RagError::ConfigError(format!("{name} must be greater than zero")));
            }
        }
        for (name, value) in [
            ("min_similarity_threshold", c.min_similarity_threshold),
            ("search_floor", c.search_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RagError::ConfigError(format!(
                    "{name} must be within [0.0, 1.0], got {value}"
                )));
            }
        }
        if c.allowed_extensions.is_empty() {
            return Err(RagError::ConfigError("at least one file extension must be allowed".into()));
        }
        Ok(self.config)
    }
}
