//! Client for OpenAI-compatible HTTP APIs (OpenRouter, vLLM, OpenAI).
//!
//! A single [`OpenAiCompatibleClient`] serves all three remote roles:
//! [`EmbeddingProvider`] via `/v1/embeddings`, [`CompletionProvider`] and
//! [`ChatModel`] via `/v1/chat/completions`. It is constructed explicitly
//! from a [`BackendConfig`] and shared as `Arc<dyn ...>`.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::BackendConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::llm::{ChatMessage, ChatModel, ChatOptions, CompletionProvider, ContentPart, Role};

const PROVIDER: &str = "OpenAI-compatible";

/// An HTTP client for an OpenAI-compatible backend.
///
/// Every request carries the configured bearer token and is bounded by the
/// configured timeout. Timeouts map to [`RagError::Timeout`], HTTP 401/403 to
/// [`RagError::AuthError`], and other failures to
/// [`RagError::EmbeddingError`] or [`RagError::CompletionError`] depending on
/// the endpoint. The client never retries.
///
/// # Example
///
/// ```rust,ignore
/// use contextual_rag::openai::OpenAiCompatibleClient;
///
/// let client = OpenAiCompatibleClient::from_env()?;
/// let vectors = client.embed_batch(&["first", "second"]).await?;
/// ```
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    config: BackendConfig,
}

impl OpenAiCompatibleClient {
    /// Create a client after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if the config is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RagError::ConfigError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Create a client from `OPENROUTER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(BackendConfig::from_env()?)
    }

    /// The backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn post_json<B, R>(&self, operation: Operation, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.config.endpoint(operation.path());

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| operation.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);

            error!(provider = PROVIDER, operation = operation.name(), %status, "API error");
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(RagError::AuthError {
                    provider: PROVIDER.into(),
                    message: format!("API returned {status}: {detail}"),
                });
            }
            return Err(operation.failure(format!("API returned {status}: {detail}")));
        }

        response.json::<R>().await.map_err(|e| {
            if e.is_timeout() {
                return operation.transport_error(e);
            }
            error!(provider = PROVIDER, operation = operation.name(), error = %e, "failed to parse response");
            operation.failure(format!("failed to parse response: {e}"))
        })
    }

    async fn embed_request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest { model: &self.config.embedding_model, input: texts };
        let response: EmbeddingResponse = self.post_json(Operation::Embeddings, &request).await?;
        embeddings_in_order(response, texts.len())
    }

    async fn chat_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String> {
        let request = ChatRequest {
            model,
            messages: messages.iter().map(WireMessage::from_message).collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            presence_penalty: options.presence_penalty,
            frequency_penalty: options.frequency_penalty,
        };
        let response: ChatResponse = self.post_json(Operation::ChatCompletion, &request).await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| extract_text(&content))
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| Operation::ChatCompletion.failure("API returned an empty completion".into()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Embeddings,
    ChatCompletion,
}

impl Operation {
    fn path(self) -> &'static str {
        match self {
            Operation::Embeddings => "embeddings",
            Operation::ChatCompletion => "chat/completions",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Operation::Embeddings => "embeddings",
            Operation::ChatCompletion => "chat completion",
        }
    }

    fn failure(self, message: String) -> RagError {
        match self {
            Operation::Embeddings => RagError::EmbeddingError { provider: PROVIDER.into(), message },
            Operation::ChatCompletion => {
                RagError::CompletionError { provider: PROVIDER.into(), message }
            }
        }
    }

    fn transport_error(self, err: reqwest::Error) -> RagError {
        if err.is_timeout() {
            error!(provider = PROVIDER, operation = self.name(), "request timed out");
            return RagError::Timeout { provider: PROVIDER.into(), operation: self.name().into() };
        }
        error!(provider = PROVIDER, operation = self.name(), error = %err, "request failed");
        self.failure(format!("request failed: {err}"))
    }
}

// ── API request/response types ─────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: WireContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<WirePart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

impl<'a> WireMessage<'a> {
    fn from_message(message: &'a ChatMessage) -> Self {
        let content = match message.parts.as_slice() {
            [ContentPart::Text(text)] => WireContent::Text(text),
            parts => WireContent::Parts(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text(text) => WirePart::Text { text },
                        ContentPart::Image { mime_type, data } => WirePart::ImageUrl {
                            image_url: ImageUrl {
                                url: format!("data:{mime_type};base64,{}", STANDARD.encode(data)),
                            },
                        },
                    })
                    .collect(),
            ),
        };
        Self { role: message.role, content }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Pull the reply text out of a message `content` value.
///
/// Backends return either a plain string or an array of typed parts.
fn extract_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => {
            map.get("text").and_then(Value::as_str).map(str::to_string).unwrap_or_default()
        }
        _ => String::new(),
    }
}

// ── Provider implementations ───────────────────────────────────────

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!(provider = PROVIDER, text_len = text.len(), "embedding single text");

        let results = self.embed_request(&[text]).await?;
        results.into_iter().next().ok_or_else(|| {
            Operation::Embeddings.failure("API returned empty response".into())
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            provider = PROVIDER,
            batch_size = texts.len(),
            model = %self.config.embedding_model,
            "embedding batch"
        );

        embed_in_batches(texts, self.config.embed_batch_size, |batch| self.embed_request(batch))
            .await
    }

    fn name(&self) -> &str {
        &self.config.embedding_model
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        debug!(provider = PROVIDER, prompt_len = prompt.len(), model = %self.config.llm_model, "completion");

        let options = ChatOptions::new(self.config.temperature, self.config.max_tokens);
        self.chat_request(&self.config.llm_model, &[ChatMessage::user(prompt)], &options).await
    }

    fn name(&self) -> &str {
        &self.config.llm_model
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleClient {
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String> {
        debug!(
            provider = PROVIDER,
            message_count = messages.len(),
            model = %self.config.vision_model(),
            "chat"
        );
        self.chat_request(self.config.vision_model(), messages, options).await
    }

    fn name(&self) -> &str {
        self.config.vision_model()
    }
}

/// Vectors from an embeddings response, in input order.
///
/// When every item carries an `index`, the indices must be exactly
/// `0..expected` and decide the order. Otherwise response order is kept.
fn embeddings_in_order(response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = response.data;
    if data.len() != expected {
        return Err(Operation::Embeddings.failure(format!(
            "expected {expected} embeddings, API returned {}",
            data.len()
        )));
    }
    if !data.iter().all(|d| d.index.is_some()) {
        return Ok(data.into_iter().map(|d| d.embedding).collect());
    }

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for item in data {
        let index = item.index.unwrap_or(usize::MAX);
        match slots.get_mut(index) {
            Some(slot @ None) => *slot = Some(item.embedding),
            _ => {
                return Err(Operation::Embeddings.failure(format!(
                    "API returned an out-of-range or duplicate embedding index {index}"
                )));
            }
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Embed `texts` in sub-batches of at most `batch_size`, concatenating the
/// results in input order.
async fn embed_in_batches<'a, F, Fut>(
    texts: &'a [&'a str],
    batch_size: usize,
    mut embed: F,
) -> Result<Vec<Vec<f32>>>
where
    F: FnMut(&'a [&'a str]) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Vec<f32>>>>,
{
    let mut embeddings = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embed(batch).await?;
        if vectors.len() != batch.len() {
            return Err(Operation::Embeddings.failure(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                vectors.len()
            )));
        }
        embeddings.extend(vectors);
    }
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn text_only_message_serializes_as_plain_string() {
        let message = ChatMessage::user("hello");
        let wire = serde_json::to_value(WireMessage::from_message(&message)).unwrap();
        assert_eq!(wire, json!({ "role": "user", "content": "hello" }));
    }

    #[test]
    fn image_message_serializes_as_parts_with_data_uri() {
        let message = ChatMessage::user("Describe this image.").with_image("image/png", vec![1, 2, 3]);
        let wire = serde_json::to_value(WireMessage::from_message(&message)).unwrap();
        assert_eq!(
            wire,
            json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": "Describe this image." },
                    { "type": "image_url", "image_url": { "url": "data:image/png;base64,AQID" } }
                ]
            })
        );
    }

    #[test]
    fn chat_request_omits_unset_sampling_options() {
        let messages = [ChatMessage::system("sys")];
        let request = ChatRequest {
            model: "m",
            messages: messages.iter().map(WireMessage::from_message).collect(),
            temperature: 0.1,
            max_tokens: 10,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert!(wire.get("top_p").is_none());
        assert_eq!(wire["messages"][0]["role"], "system");
    }

    #[test]
    fn extracts_text_from_every_content_shape() {
        assert_eq!(extract_text(&json!("plain")), "plain");
        assert_eq!(
            extract_text(&json!([{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }])),
            "a\nb"
        );
        assert_eq!(extract_text(&json!({ "text": "obj" })), "obj");
        assert_eq!(extract_text(&json!(null)), "");
    }

    #[test]
    fn embedding_response_accepts_missing_index() {
        let parsed: EmbeddingResponse =
            serde_json::from_value(json!({ "data": [{ "embedding": [0.1, 0.2, 0.3] }] })).unwrap();
        assert_eq!(parsed.data[0].index, None);
        assert_eq!(parsed.data[0].embedding, vec![0.1, 0.2, 0.3]);
    }

    fn response(value: serde_json::Value) -> EmbeddingResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn embeddings_are_reordered_by_index() {
        let parsed = response(json!({ "data": [
            { "index": 1, "embedding": [1.0] },
            { "index": 2, "embedding": [2.0] },
            { "index": 0, "embedding": [0.0] },
        ] }));
        assert_eq!(embeddings_in_order(parsed, 3).unwrap(), vec![vec![0.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn embeddings_without_indices_keep_response_order() {
        let parsed = response(json!({ "data": [
            { "embedding": [5.0] },
            { "embedding": [4.0] },
        ] }));
        assert_eq!(embeddings_in_order(parsed, 2).unwrap(), vec![vec![5.0], vec![4.0]]);
    }

    #[test]
    fn short_embedding_response_is_an_error() {
        let parsed = response(json!({ "data": [{ "index": 0, "embedding": [1.0] }] }));
        let err = embeddings_in_order(parsed, 2).unwrap_err();
        assert!(matches!(err, RagError::EmbeddingError { ref message, .. } if message.contains("expected 2")));
    }

    #[test]
    fn duplicate_or_out_of_range_indices_are_errors() {
        let duplicate = response(json!({ "data": [
            { "index": 0, "embedding": [1.0] },
            { "index": 0, "embedding": [2.0] },
        ] }));
        assert!(matches!(embeddings_in_order(duplicate, 2), Err(RagError::EmbeddingError { .. })));

        let out_of_range = response(json!({ "data": [
            { "index": 0, "embedding": [1.0] },
            { "index": 5, "embedding": [2.0] },
        ] }));
        assert!(matches!(embeddings_in_order(out_of_range, 2), Err(RagError::EmbeddingError { .. })));
    }

    #[tokio::test]
    async fn sub_batches_are_concatenated_in_input_order() {
        let texts = ["a", "bb", "ccc", "dddd", "eeeee"];
        let mut sizes = Vec::new();
        let vectors = embed_in_batches(&texts, 2, |batch| {
            sizes.push(batch.len());
            let out: Vec<Vec<f32>> = batch.iter().map(|t| vec![t.len() as f32]).collect();
            async move { Ok(out) }
        })
        .await
        .unwrap();

        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(vectors, vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0], vec![5.0]]);
    }

    #[tokio::test]
    async fn sub_batch_failure_or_shortfall_stops_the_batch() {
        let texts = ["a", "b", "c"];
        let mut calls = 0;
        let err = embed_in_batches(&texts, 1, |_| {
            calls += 1;
            let result = if calls == 2 {
                Err(Operation::Embeddings.failure("HTTP 500".into()))
            } else {
                Ok(vec![vec![0.0]])
            };
            async move { result }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::EmbeddingError { .. }));
        assert_eq!(calls, 2);

        let short = embed_in_batches(&texts, 3, |_| async { Ok(vec![vec![0.0]]) }).await;
        assert!(matches!(short, Err(RagError::EmbeddingError { .. })));
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = BackendConfig::new("ftp://example", "sk-x", "e", "l");
        assert!(matches!(OpenAiCompatibleClient::new(config), Err(RagError::ConfigError(_))));
    }

    #[test]
    fn failures_map_to_the_endpoint_error() {
        assert!(matches!(
            Operation::Embeddings.failure("x".into()),
            RagError::EmbeddingError { .. }
        ));
        assert!(matches!(
            Operation::ChatCompletion.failure("x".into()),
            RagError::CompletionError { .. }
        ));
    }
}
