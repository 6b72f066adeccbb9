//! Session-scoped chat about an uploaded image.
//!
//! [`ImageChat::start`] sends the image with a description request and keeps
//! the conversation; [`ImageChat::ask`] continues it with text-only follow-up
//! questions. Conversations live in a [`SessionCache`] that evicts the least
//! recently used session once full.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{RagError, Result};
use crate::llm::{ChatMessage, ChatModel, ChatOptions};

/// Default number of sessions kept before the least recently used is evicted.
pub const DEFAULT_SESSION_CAPACITY: usize = 100;

/// Default number of follow-up exchanges kept per session.
pub const DEFAULT_MAX_FOLLOW_UPS: usize = 10;

/// System prompt, image request and the model's description.
const OPENING_MESSAGES: usize = 3;

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// A bounded map from session id to conversation with least-recently-used eviction.
#[derive(Debug)]
pub struct SessionCache {
    capacity: usize,
    clock: u64,
    entries: HashMap<String, (u64, Vec<ChatMessage>)>,
}

impl SessionCache {
    /// Create a cache holding at most `capacity` sessions (at least one).
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), clock: 0, entries: HashMap::new() }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `session` is live. Does not count as a use.
    pub fn contains(&self, session: &str) -> bool {
        self.entries.contains_key(session)
    }

    /// The conversation of `session`, marking it as recently used.
    pub fn get(&mut self, session: &str) -> Option<&[ChatMessage]> {
        self.clock += 1;
        let tick = self.clock;
        self.entries.get_mut(session).map(|(used, messages)| {
            *used = tick;
            messages.as_slice()
        })
    }

    /// Store a conversation, evicting the least recently used session if full.
    ///
    /// Returns the id of the evicted session, if any.
    pub fn insert(&mut self, session: impl Into<String>, messages: Vec<ChatMessage>) -> Option<String> {
        let session = session.into();
        self.clock += 1;

        let mut evicted = None;
        if !self.entries.contains_key(&session) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (used, _))| *used)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                self.entries.remove(&key);
                evicted = Some(key);
            }
        }

        self.entries.insert(session, (self.clock, messages));
        evicted
    }

    /// Append messages to an existing session, then drop the oldest
    /// follow-up exchanges beyond `max_follow_ups`. The opening exchange
    /// with the image is always kept.
    ///
    /// Returns `false` if the session is gone.
    pub fn extend(
        &mut self,
        session: &str,
        messages: impl IntoIterator<Item = ChatMessage>,
        max_follow_ups: usize,
    ) -> bool {
        self.clock += 1;
        let tick = self.clock;
        match self.entries.get_mut(session) {
            Some((used, conversation)) => {
                *used = tick;
                conversation.extend(messages);
                trim_follow_ups(conversation, max_follow_ups);
                true
            }
            None => false,
        }
    }

    /// Drop `session`. Returns whether it existed.
    pub fn remove(&mut self, session: &str) -> bool {
        self.entries.remove(session).is_some()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY)
    }
}

/// Multi-turn chat about one image per session.
///
/// # Example
///
/// ```rust,ignore
/// let chat = ImageChat::new(Arc::new(client));
/// let description = chat.start("channel-1", &png_bytes, "Describe this image.").await?;
/// let reply = chat.ask("channel-1", "What colour is the car?").await?;
/// ```
pub struct ImageChat {
    model: Arc<dyn ChatModel>,
    options: ChatOptions,
    max_follow_ups: usize,
    sessions: Mutex<SessionCache>,
}

impl ImageChat {
    /// Create an image chat with [`ChatOptions::vision`] and the default capacity.
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self::with_capacity(model, DEFAULT_SESSION_CAPACITY)
    }

    /// Create an image chat keeping at most `capacity` sessions.
    pub fn with_capacity(model: Arc<dyn ChatModel>, capacity: usize) -> Self {
        Self {
            model,
            options: ChatOptions::vision(),
            max_follow_ups: DEFAULT_MAX_FOLLOW_UPS,
            sessions: Mutex::new(SessionCache::new(capacity)),
        }
    }

    /// Keep at most `max` follow-up exchanges per session.
    pub fn with_max_follow_ups(mut self, max: usize) -> Self {
        self.max_follow_ups = max;
        self
    }

    /// Override the sampling options.
    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Start a conversation about `image`, replacing any previous one in `session`.
    ///
    /// Returns the model's description of the image.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ValidationError`] if the image is empty or not a
    /// PNG, JPEG, GIF or WebP file, and propagates model errors.
    pub async fn start(&self, session: &str, image: &[u8], prompt: &str) -> Result<String> {
        let mime_type = image_mime_type(image).ok_or_else(|| {
            RagError::ValidationError("image must be a PNG, JPEG, GIF or WebP file".into())
        })?;
        let prompt = if prompt.trim().is_empty() { "Describe this image." } else { prompt.trim() };

        let mut messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "{prompt}\n\
                 Be concise: answer in 1-3 short sentences, do not repeat yourself.\n\
                 Also add three or four relevant tags (comma-separated) on a single line."
            ))
            .with_image(mime_type, image),
        ];

        let reply = self.model.chat(&messages, &self.options).await?;
        let reply = reply.trim().to_string();
        messages.push(ChatMessage::assistant(reply.clone()));

        if let Some(evicted) = self.sessions.lock().await.insert(session, messages) {
            debug!(session = %evicted, "evicted least recently used image session");
        }
        info!(session, mime_type, "started image conversation");
        Ok(reply)
    }

    /// Ask a follow-up question about the image in `session`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::NoImageContext`] if the session has no image, and
    /// propagates model errors.
    pub async fn ask(&self, session: &str, question: &str) -> Result<String> {
        if question.trim().is_empty() {
            return Err(RagError::ValidationError("question cannot be empty".into()));
        }

        let mut conversation = self
            .sessions
            .lock()
            .await
            .get(session)
            .map(<[ChatMessage]>::to_vec)
            .ok_or_else(|| RagError::NoImageContext { session: session.to_string() })?;

        let follow_up = ChatMessage::user(format!(
            "Follow-up question about the previous image.\n\
             Be concise: answer in 1-2 short sentences, do not repeat yourself.\n\
             Don't repeat previous answers.\n\
             If the question is not related to the image, respond with \
             'I can only answer questions related to the image.'\n\
             Question: {}",
            question.trim()
        ));
        conversation.push(follow_up.clone());

        let reply = self.model.chat(&conversation, &self.options).await?;
        let reply = reply.trim().to_string();

        let kept = self
            .sessions
            .lock()
            .await
            .extend(
                session,
                [follow_up, ChatMessage::assistant(reply.clone())],
                self.max_follow_ups,
            );
        if !kept {
            debug!(session, "image session ended while a follow-up was in flight");
        }
        Ok(reply)
    }

    /// Forget the conversation in `session`. Returns whether one existed.
    pub async fn clear(&self, session: &str) -> bool {
        self.sessions.lock().await.remove(session)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Drop the oldest follow-up exchanges so at most `max_follow_ups` remain
/// after the opening exchange.
fn trim_follow_ups(conversation: &mut Vec<ChatMessage>, max_follow_ups: usize) {
    let limit = OPENING_MESSAGES + 2 * max_follow_ups;
    if conversation.len() > limit {
        let excess = conversation.len() - limit;
        conversation.drain(OPENING_MESSAGES..OPENING_MESSAGES + excess);
    }
}

/// Detect the MIME type of an image from its leading bytes.
pub fn image_mime_type(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::{ContentPart, Role};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    /// Records every conversation it is sent and replies with the turn count.
    #[derive(Default)]
    struct RecordingModel {
        seen: StdMutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl ChatModel for RecordingModel {
        async fn chat(&self, messages: &[ChatMessage], _options: &ChatOptions) -> Result<String> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(messages.to_vec());
            Ok(format!(" reply {} ", seen.len()))
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = SessionCache::new(2);
        assert_eq!(cache.insert("a", Vec::new()), None);
        assert_eq!(cache.insert("b", Vec::new()), None);
        assert!(cache.get("a").is_some());
        assert_eq!(cache.insert("c", Vec::new()), Some("b".to_string()));
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinserting_a_session_does_not_evict() {
        let mut cache = SessionCache::new(1);
        cache.insert("a", Vec::new());
        assert_eq!(cache.insert("a", vec![ChatMessage::user("hi")]), None);
        assert_eq!(cache.get("a").map(<[ChatMessage]>::len), Some(1));
    }

    #[test]
    fn detects_common_image_formats() {
        assert_eq!(image_mime_type(PNG), Some("image/png"));
        assert_eq!(image_mime_type(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(image_mime_type(b"GIF89a"), Some("image/gif"));
        assert_eq!(image_mime_type(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(image_mime_type(b"plain text"), None);
    }

    #[tokio::test]
    async fn start_sends_image_then_follow_ups_are_text_only() {
        let model = Arc::new(RecordingModel::default());
        let chat = ImageChat::new(model.clone());

        let description = chat.start("s1", PNG, "What is this?").await.unwrap();
        assert_eq!(description, "reply 1");
        let answer = chat.ask("s1", "Is it outside?").await.unwrap();
        assert_eq!(answer, "reply 2");

        let seen = model.seen.lock().unwrap();
        let first = &seen[0];
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], ChatMessage::system(SYSTEM_PROMPT));
        assert!(!first[1].is_text_only());
        assert!(matches!(&first[1].parts[0], ContentPart::Text(t) if t.starts_with("What is this?")));

        let second = &seen[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[2], ChatMessage::assistant("reply 1"));
        assert_eq!(second[3].role, Role::User);
        assert!(second[3].is_text_only());
    }

    #[tokio::test]
    async fn follow_up_without_image_is_an_error() {
        let chat = ImageChat::new(Arc::new(RecordingModel::default()));
        let err = chat.ask("nobody", "What is it?").await.unwrap_err();
        assert!(matches!(err, RagError::NoImageContext { session } if session == "nobody"));
    }

    #[tokio::test]
    async fn clear_forgets_the_image() {
        let chat = ImageChat::new(Arc::new(RecordingModel::default()));
        chat.start("s1", PNG, "").await.unwrap();
        assert!(chat.clear("s1").await);
        assert!(!chat.clear("s1").await);
        assert!(chat.ask("s1", "Still there?").await.is_err());
    }

    #[tokio::test]
    async fn oldest_session_is_evicted_at_capacity() {
        let chat = ImageChat::with_capacity(Arc::new(RecordingModel::default()), 2);
        chat.start("a", PNG, "").await.unwrap();
        chat.start("b", PNG, "").await.unwrap();
        chat.start("c", PNG, "").await.unwrap();
        assert_eq!(chat.session_count().await, 2);
        assert!(matches!(chat.ask("a", "?").await, Err(RagError::NoImageContext { .. })));
        assert!(chat.ask("c", "Anything else?").await.is_ok());
    }

    #[tokio::test]
    async fn long_sessions_keep_the_image_and_the_latest_follow_ups() {
        let model = Arc::new(RecordingModel::default());
        let chat = ImageChat::new(model.clone()).with_max_follow_ups(2);
        chat.start("s1", PNG, "").await.unwrap();
        for i in 1..=5 {
            chat.ask("s1", &format!("q{i}")).await.unwrap();
        }

        let seen = model.seen.lock().unwrap();
        let last = &seen[5];
        assert_eq!(last.len(), OPENING_MESSAGES + 2 * 2 + 1);
        assert_eq!(last[0], ChatMessage::system(SYSTEM_PROMPT));
        assert_eq!(last[2], ChatMessage::assistant("reply 1"));
        assert!(matches!(&last[3].parts[0], ContentPart::Text(t) if t.ends_with("Question: q3")));
        assert!(matches!(&last[7].parts[0], ContentPart::Text(t) if t.ends_with("Question: q5")));

        let image = |messages: &[ChatMessage]| match &messages[1].parts[1] {
            ContentPart::Image { data, .. } => data.clone(),
            other => panic!("expected the image, got {other:?}"),
        };
        assert!(Arc::ptr_eq(&image(&seen[1]), &image(last)));
    }

    #[test]
    fn trimming_leaves_short_conversations_alone() {
        let mut conversation: Vec<ChatMessage> =
            (0..5).map(|i| ChatMessage::user(format!("m{i}"))).collect();
        trim_follow_ups(&mut conversation, 1);
        assert_eq!(conversation.len(), 5);
        trim_follow_ups(&mut conversation, 0);
        assert_eq!(conversation.len(), OPENING_MESSAGES);
        assert_eq!(conversation[2], ChatMessage::user("m2"));
    }

    #[tokio::test]
    async fn non_image_bytes_are_rejected() {
        let chat = ImageChat::new(Arc::new(RecordingModel::default()));
        let err = chat.start("s1", b"hello", "Describe").await.unwrap_err();
        assert!(matches!(err, RagError::ValidationError(_)));
    }
}
