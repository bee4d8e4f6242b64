use std::sync::Arc;

use lexi_storage::KeyValueStore;

use super::message::ChatMessage;

pub const DEFAULT_HISTORY_KEY: &str = "legalChatHistory";
pub const DEFAULT_JURISDICTION_KEY: &str = "legalChatJurisdiction";
pub const INTERRUPTED_TEXT: &str = "This response was interrupted before it finished.";

/// Persists the conversation and the jurisdiction in a key-value store.
///
/// Every failure degrades to defaults with a warning; nothing here blocks the chat.
pub struct ChatHistory {
    store: Arc<dyn KeyValueStore>,
    history_key: String,
    jurisdiction_key: String,
}

impl ChatHistory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_keys(store, DEFAULT_HISTORY_KEY, DEFAULT_JURISDICTION_KEY)
    }

    pub fn with_keys(
        store: Arc<dyn KeyValueStore>,
        history_key: impl Into<String>,
        jurisdiction_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            history_key: history_key.into(),
            jurisdiction_key: jurisdiction_key.into(),
        }
    }

    /// Restored conversation, or `[seed]` when nothing usable is stored.
    pub async fn load_messages(&self, seed: &ChatMessage) -> Vec<ChatMessage> {
        let raw = match self.store.get(&self.history_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return vec![seed.clone()],
            Err(error) => {
                tracing::warn!(key = %self.history_key, error = %error, "failed to read chat history");
                return vec![seed.clone()];
            }
        };

        let messages = match serde_json::from_str::<Vec<ChatMessage>>(&raw) {
            Ok(messages) if !messages.is_empty() => messages,
            Ok(_) => return vec![seed.clone()],
            Err(error) => {
                tracing::warn!(key = %self.history_key, error = %error, "stored chat history is malformed");
                return vec![seed.clone()];
            }
        };

        messages.into_iter().map(mark_interrupted).collect()
    }

    pub async fn save_messages(&self, messages: &[ChatMessage]) {
        let payload = match serde_json::to_string(messages) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(error = %error, "failed to serialize chat history");
                return;
            }
        };

        if let Err(error) = self.store.set(&self.history_key, payload).await {
            tracing::warn!(key = %self.history_key, error = %error, "failed to save chat history");
        }
    }

    pub async fn clear_messages(&self) {
        if let Err(error) = self.store.remove(&self.history_key).await {
            tracing::warn!(key = %self.history_key, error = %error, "failed to clear chat history");
        }
    }

    pub async fn load_jurisdiction(&self) -> String {
        match self.store.get(&self.jurisdiction_key).await {
            Ok(value) => value.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(key = %self.jurisdiction_key, error = %error, "failed to read jurisdiction");
                String::new()
            }
        }
    }

    pub async fn save_jurisdiction(&self, jurisdiction: &str) {
        if let Err(error) = self
            .store
            .set(&self.jurisdiction_key, jurisdiction.to_string())
            .await
        {
            tracing::warn!(key = %self.jurisdiction_key, error = %error, "failed to save jurisdiction");
        }
    }
}

// A reply still loading when the app stopped can never finish; without its retry
// command it becomes a plain error bubble so the conversation is not stuck busy.
fn mark_interrupted(mut message: ChatMessage) -> ChatMessage {
    if message.is_loading {
        message.is_loading = false;
        message.is_error = true;
        message.text = INTERRUPTED_TEXT.to_string();
        message.suggestions = None;
        message.sources = None;
    }
    message
}
