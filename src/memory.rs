use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::DroverError;

/// Singleton key holding the most recently used conversation id.
const LAST_CONVERSATION_KEY: &str = "last_conversation_id";

/// Tag prefixed to the summary message so the worker can distinguish it from
/// a literal prior exchange.
pub const SUMMARY_TAG: &str = "[Conversation summary]";

/// Delimiter the orchestrator appends between rendered context and the new
/// request. Splitting a full prompt on it recovers the rendered context.
pub const CURRENT_REQUEST_DELIMITER: &str = "[Current Request]: ";

/// How many trailing renderable messages survive a summarization verbatim.
const SUMMARY_KEEP_TAIL: usize = 3;

fn conversation_key(id: Uuid) -> String {
    format!("conversation:{id}")
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Author of a message. The role tags the author of the content, not a
/// meta-classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: u64,
}

/// Stored per-conversation record. Messages are append-only; when a
/// summarized prefix is present it logically replaces the raw log at render
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_prefix: Option<Vec<Message>>,
    pub created_at: u64,
    pub last_accessed_at: u64,
}

impl Conversation {
    fn new(id: Uuid) -> Self {
        let now = epoch_ms();
        Self {
            id,
            messages: Vec::new(),
            summarized_prefix: None,
            created_at: now,
            last_accessed_at: now,
        }
    }

    /// Renderable view: the summarized prefix wins over the raw log.
    fn renderable(&self) -> &[Message] {
        match &self.summarized_prefix {
            Some(prefix) => prefix,
            None => &self.messages,
        }
    }
}

/// Contract of the persistent key-value backend. The store itself is an
/// external collaborator; anything honoring get/set-with-TTL/expire plugs in.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, DroverError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), DroverError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), DroverError>;
}

/// In-process TTL store. Entries expire lazily on access.
#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, DroverError> {
        let mut entries = self.entries.lock().await;
        let expired =
            matches!(entries.get(key), Some((_, expires_at)) if *expires_at <= Instant::now());
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), DroverError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), DroverError> {
        let mut entries = self.entries.lock().await;
        if let Some((_, expires_at)) = entries.get_mut(key) {
            *expires_at = Instant::now() + ttl;
        }
        Ok(())
    }
}

/// Ordered per-conversation message log over a TTL key-value store, with a
/// "last used conversation" pointer and in-place summarization.
///
/// Degraded mode: when the backing store is unreachable every operation
/// degrades silently. Ids are still minted, appends and summaries become
/// no-ops, and rendering returns an empty sequence; what is lost is
/// continuity across calls, never the current request.
pub struct ConversationMemory {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ConversationMemory {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Resolve the conversation to use: an explicit id is touched and
    /// returned; otherwise the last-used id; otherwise a fresh one is minted
    /// and becomes last-used.
    pub async fn resolve_conversation_id(&self, explicit: Option<Uuid>) -> Uuid {
        if let Some(id) = explicit {
            self.touch_or_create(id).await;
            return id;
        }

        match self.store.get(LAST_CONVERSATION_KEY).await {
            Ok(Some(raw)) => {
                if let Ok(id) = raw.parse::<Uuid>() {
                    self.touch_or_create(id).await;
                    self.set_last(id).await;
                    return id;
                }
                tracing::warn!("memory: last conversation pointer is not a valid id — minting");
                self.force_new_conversation().await
            }
            Ok(None) => self.force_new_conversation().await,
            Err(e) => {
                tracing::warn!("memory: {e} — continuing without stored context");
                Uuid::new_v4()
            }
        }
    }

    /// Mint a fresh conversation, set it as last-used, create an empty record.
    pub async fn force_new_conversation(&self) -> Uuid {
        let id = Uuid::new_v4();
        let conversation = Conversation::new(id);
        if let Err(e) = self.save(&conversation).await {
            tracing::warn!("memory: {e} — conversation will not persist");
        }
        self.set_last(id).await;
        id
    }

    /// Append one message and refresh the TTL. Callers must never append
    /// reviewer free-form output here; only the orchestrator's tagged
    /// verdict line enters the log.
    pub async fn append(&self, id: Uuid, role: Role, content: &str) {
        let mut conversation = match self.load(id).await {
            Ok(Some(c)) => c,
            Ok(None) => Conversation::new(id),
            Err(e) => {
                tracing::warn!("memory: append skipped: {e}");
                return;
            }
        };
        conversation.messages.push(Message {
            role,
            content: content.to_string(),
            timestamp: epoch_ms(),
        });
        conversation.last_accessed_at = epoch_ms();
        if let Err(e) = self.save(&conversation).await {
            tracing::warn!("memory: append not persisted: {e}");
        }
    }

    /// Renderable messages: the summarized prefix if present, else the raw
    /// log. Empty when the store is unreachable.
    pub async fn render_context(&self, id: Uuid) -> Vec<Message> {
        match self.load(id).await {
            Ok(Some(conversation)) => {
                let messages = conversation.renderable().to_vec();
                self.refresh(id).await;
                messages
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("memory: render degraded to empty context: {e}");
                Vec::new()
            }
        }
    }

    /// Raw messages only, bypassing the summarized prefix.
    pub async fn raw_messages(&self, id: Uuid) -> Vec<Message> {
        match self.load(id).await {
            Ok(Some(conversation)) => conversation.messages,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("memory: raw read degraded to empty: {e}");
                Vec::new()
            }
        }
    }

    /// Replace the renderable prefix with `[summary, ...last-3 renderable]`.
    ///
    /// `summarizer` receives the rendered text of the current renderable
    /// messages and returns the single summary string. Failures propagate so
    /// the caller can decide to swallow them.
    pub async fn summarize<F, Fut>(&self, id: Uuid, summarizer: F) -> Result<(), DroverError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, DroverError>>,
    {
        let mut conversation = match self.load(id).await {
            Ok(Some(c)) => c,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!("memory: summarize skipped: {e}");
                return Ok(());
            }
        };

        let renderable = conversation.renderable().to_vec();
        if renderable.is_empty() {
            return Ok(());
        }

        let summary = summarizer(render_messages(&renderable)).await?;

        let mut prefix = Vec::with_capacity(SUMMARY_KEEP_TAIL + 1);
        prefix.push(Message {
            role: Role::Assistant,
            content: format!("{SUMMARY_TAG} {summary}"),
            timestamp: epoch_ms(),
        });
        let tail_start = renderable.len().saturating_sub(SUMMARY_KEEP_TAIL);
        prefix.extend(renderable[tail_start..].iter().cloned());

        conversation.summarized_prefix = Some(prefix);
        conversation.last_accessed_at = epoch_ms();
        if let Err(e) = self.save(&conversation).await {
            tracing::warn!("memory: summary not persisted: {e}");
        }
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Conversation>, DroverError> {
        match self.store.get(&conversation_key(id)).await? {
            Some(raw) => match serde_json::from_str::<Conversation>(&raw) {
                Ok(c) => Ok(Some(c)),
                Err(e) => {
                    tracing::warn!("memory: corrupt conversation record, discarding: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), DroverError> {
        let raw = serde_json::to_string(conversation)
            .map_err(|e| DroverError::Other(format!("conversation serialization: {e}")))?;
        self.store
            .set(&conversation_key(conversation.id), raw, self.ttl)
            .await
    }

    async fn touch_or_create(&self, id: Uuid) {
        match self.load(id).await {
            Ok(Some(mut conversation)) => {
                conversation.last_accessed_at = epoch_ms();
                if let Err(e) = self.save(&conversation).await {
                    tracing::warn!("memory: touch not persisted: {e}");
                }
            }
            Ok(None) => {
                // Expired or never seen: recreate lazily under the caller's id.
                if let Err(e) = self.save(&Conversation::new(id)).await {
                    tracing::warn!("memory: create not persisted: {e}");
                }
            }
            Err(e) => tracing::warn!("memory: touch skipped: {e}"),
        }
    }

    async fn refresh(&self, id: Uuid) {
        if let Err(e) = self.store.expire(&conversation_key(id), self.ttl).await {
            tracing::warn!("memory: ttl refresh skipped: {e}");
        }
        let _ = self
            .store
            .expire(LAST_CONVERSATION_KEY, self.ttl)
            .await;
    }

    async fn set_last(&self, id: Uuid) {
        if let Err(e) = self
            .store
            .set(LAST_CONVERSATION_KEY, id.to_string(), self.ttl)
            .await
        {
            tracing::warn!("memory: last conversation pointer not persisted: {e}");
        }
    }
}

/// Textual form of a message sequence: `role: content` per message,
/// blank-line separated.
pub fn render_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.prefix(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Full worker prompt: rendered context, a blank line, then the delimiter
/// and the new request. An empty context yields the bare request.
pub fn compose_prompt(context: &str, request: &str) -> String {
    if context.is_empty() {
        request.to_string()
    } else {
        format!("{context}\n\n{CURRENT_REQUEST_DELIMITER}{request}")
    }
}
