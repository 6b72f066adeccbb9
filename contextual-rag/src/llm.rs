//! Language-model traits and chat message types.
//!
//! [`CompletionProvider`] is the single-prompt seam used for context
//! generation and answer synthesis. [`ChatModel`] carries multi-turn,
//! multimodal conversations for image chat.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A provider that turns one prompt into one completion.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Complete `prompt` and return the model's reply text.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Name of the model, used in logs and status output.
    fn name(&self) -> &str;
}

/// The author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that frame the whole conversation.
    System,
    /// The person asking.
    User,
    /// The model's earlier replies.
    Assistant,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContentPart {
    /// Plain text.
    Text(String),
    /// Raw image bytes with their MIME type, e.g. `image/png`.
    ///
    /// The bytes are shared, so cloning a conversation does not copy the image.
    Image { mime_type: String, data: Arc<[u8]> },
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who wrote the message.
    pub role: Role,
    /// Content in the order it is sent.
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    /// A text-only message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self { role, parts: vec![ContentPart::Text(text.into())] }
    }

    /// A system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// A user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// An assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// Append an image to the message.
    pub fn with_image(mut self, mime_type: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        self.parts.push(ContentPart::Image { mime_type: mime_type.into(), data: data.into() });
        self
    }

    /// Whether the message carries only text.
    pub fn is_text_only(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, ContentPart::Text(_)))
    }
}

/// Sampling parameters for a chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on reply length, in tokens.
    pub max_tokens: u32,
    /// Nucleus sampling cut-off. Omitted from requests when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Penalty for tokens already present. Omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// Penalty scaled by token frequency. Omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

impl ChatOptions {
    /// Options with only temperature and token limit set.
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self { temperature, max_tokens, top_p: None, presence_penalty: None, frequency_penalty: None }
    }

    /// Short, focused replies suited to image description.
    pub fn vision() -> Self {
        Self {
            temperature: 0.35,
            max_tokens: 150,
            top_p: Some(0.8),
            presence_penalty: Some(0.3),
            frequency_penalty: Some(1.5),
        }
    }
}

/// A model that continues a multi-turn, possibly multimodal conversation.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send the conversation and return the assistant's reply text.
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String>;

    /// Name of the model.
    fn name(&self) -> &str;
}
