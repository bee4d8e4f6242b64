use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use lexi_llm::ImageAttachment;
use tokio::sync::watch;

use super::controller::{ErrorCategory, ExchangeOutcome, ResponseStreamer};
use super::history::{ChatHistory, DEFAULT_HISTORY_KEY, DEFAULT_JURISDICTION_KEY};
use super::instruction::SYSTEM_INSTRUCTION;
use super::message::{ChatMessage, ExchangeRequest, Feedback, MessageId, Sender, derive_history};
use super::store::{MessageHandle, MessageStore, Snapshot};
use crate::services::{Capability, Coordinates, JurisdictionLocator};

pub const DEFAULT_WELCOME_MESSAGE: &str = "Hello! I am an AI assistant here to provide general information on legal rights. How can I help you today? Please remember, I'm not a lawyer and this isn't legal advice.";
pub const DEFAULT_IMAGE_ONLY_PROMPT: &str = "Simplify the legal text in this document.";
pub const DEFAULT_QUICK_SUGGESTIONS: [&str; 3] =
    ["Consumer Rights", "Landlord/Tenant Issues", "Workplace Rights"];

/// Conversation-level configuration injected at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub welcome_message: String,
    pub quick_suggestions: Vec<String>,
    /// Text sent when the user attaches an image without typing anything.
    pub image_only_prompt: String,
    pub system_instruction: String,
    pub history_key: String,
    pub jurisdiction_key: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
            quick_suggestions: DEFAULT_QUICK_SUGGESTIONS
                .iter()
                .map(|chip| chip.to_string())
                .collect(),
            image_only_prompt: DEFAULT_IMAGE_ONLY_PROMPT.to_string(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            history_key: DEFAULT_HISTORY_KEY.to_string(),
            jurisdiction_key: DEFAULT_JURISDICTION_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Another reply is still loading; nothing changed.
    Busy,
    /// No text and no image; nothing changed.
    Empty,
    /// The message is not a failed reply with a retry command.
    NothingToRetry,
    Completed { message_id: MessageId },
    Failed {
        message_id: MessageId,
        category: ErrorCategory,
    },
}

impl SendOutcome {
    fn from_exchange(message_id: MessageId, outcome: ExchangeOutcome) -> Self {
        match outcome {
            ExchangeOutcome::Completed => Self::Completed { message_id },
            ExchangeOutcome::Failed(category) => Self::Failed {
                message_id,
                category,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateOutcome {
    Located(String),
    NotFound,
    Unavailable { reason: String },
}

/// Owns the conversation for a session and enforces one exchange at a time.
pub struct ChatOrchestrator {
    store: Arc<MessageStore>,
    streamer: ResponseStreamer,
    history: ChatHistory,
    config: ChatConfig,
    jurisdiction: ArcSwap<String>,
    quick_suggestions_visible: AtomicBool,
    locator: Capability<Arc<dyn JurisdictionLocator>>,
}

impl ChatOrchestrator {
    /// Restores the persisted conversation and jurisdiction, falling back to the seed.
    pub async fn load(
        config: ChatConfig,
        streamer: ResponseStreamer,
        history: ChatHistory,
        locator: Capability<Arc<dyn JurisdictionLocator>>,
    ) -> Self {
        let seed = ChatMessage::seed(config.welcome_message.clone());
        let messages = history.load_messages(&seed).await;
        let jurisdiction = history.load_jurisdiction().await;

        tracing::info!(
            restored_messages = messages.len(),
            has_jurisdiction = !jurisdiction.trim().is_empty(),
            "chat session loaded"
        );

        Self {
            quick_suggestions_visible: AtomicBool::new(messages.len() <= 1),
            store: Arc::new(MessageStore::new(messages)),
            streamer,
            history,
            config,
            jurisdiction: ArcSwap::from_pointee(jurisdiction),
            locator,
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn streamer(&self) -> &ResponseStreamer {
        &self.streamer
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn messages(&self) -> Snapshot {
        self.store.all()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.store.in_flight().is_some()
    }

    pub fn show_quick_suggestions(&self) -> bool {
        self.quick_suggestions_visible.load(Ordering::SeqCst)
    }

    pub fn quick_suggestions(&self) -> &[String] {
        &self.config.quick_suggestions
    }

    /// Sends a user message and streams the reply. Resolves once the reply is final.
    pub async fn send(&self, text: &str, image: Option<ImageAttachment>) -> SendOutcome {
        let trimmed = text.trim();
        if trimmed.is_empty() && image.is_none() {
            return SendOutcome::Empty;
        }
        if self.is_loading() {
            return SendOutcome::Busy;
        }

        let text = if trimmed.is_empty() {
            self.config.image_only_prompt.clone()
        } else {
            trimmed.to_string()
        };

        let history = derive_history(&self.store.all());
        let placeholder_id = MessageId::new_v7();
        let appended = self.store.append_if_idle(vec![
            ChatMessage::user(text.clone(), image.clone()),
            ChatMessage::placeholder(placeholder_id),
        ]);
        if !appended {
            return SendOutcome::Busy;
        }

        self.quick_suggestions_visible.store(false, Ordering::SeqCst);
        self.persist().await;

        let request = ExchangeRequest {
            text,
            image,
            jurisdiction: self.jurisdiction(),
            history,
        };
        let outcome = self
            .streamer
            .run(MessageHandle::new(Arc::clone(&self.store), placeholder_id), request)
            .await;
        self.persist().await;

        SendOutcome::from_exchange(placeholder_id, outcome)
    }

    pub async fn click_suggestion(&self, suggestion: &str) -> SendOutcome {
        self.send(suggestion, None).await
    }

    /// Replays the failed exchange behind `id` into the same message.
    pub async fn retry(&self, id: MessageId) -> SendOutcome {
        let Some(command) = self
            .store
            .get(id)
            .filter(|message| message.is_error)
            .and_then(|message| message.retry_request)
        else {
            return SendOutcome::NothingToRetry;
        };

        if !self.store.update_if_idle(id, ChatMessage::reset_to_placeholder) {
            return SendOutcome::Busy;
        }
        tracing::info!(message_id = %id, "retrying exchange");
        self.persist().await;

        let outcome = self
            .streamer
            .run(
                MessageHandle::new(Arc::clone(&self.store), command.message_id),
                command.request,
            )
            .await;
        self.persist().await;

        SendOutcome::from_exchange(id, outcome)
    }

    /// Records a rating on a finished bot message, the welcome message included.
    /// Only the first rating sticks.
    pub async fn give_feedback(&self, id: MessageId, feedback: Feedback) -> bool {
        let rateable = self.store.get(id).is_some_and(|message| {
            message.sender == Sender::Bot
                && !message.is_loading
                && !message.is_error
                && !message.text.is_empty()
                && message.feedback.is_none()
        });
        if !rateable {
            return false;
        }

        let mut recorded = false;
        self.store.update_by_id(id, |message| {
            recorded = message.feedback.is_none();
            if recorded {
                message.feedback = Some(feedback);
            }
        });

        if recorded {
            tracing::debug!(message_id = %id, feedback = ?feedback, "feedback recorded");
            self.persist().await;
        }
        recorded
    }

    /// Drops the stored history and returns to the seed conversation. Refused while busy.
    pub async fn clear_history(&self) -> bool {
        if self.is_loading() {
            return false;
        }

        self.store
            .replace_all(vec![ChatMessage::seed(self.config.welcome_message.clone())]);
        self.history.clear_messages().await;
        tracing::info!("chat history cleared");
        true
    }

    pub fn jurisdiction(&self) -> String {
        self.jurisdiction.load().as_ref().clone()
    }

    pub async fn set_jurisdiction(&self, jurisdiction: &str) {
        let jurisdiction = jurisdiction.trim().to_string();
        self.history.save_jurisdiction(&jurisdiction).await;
        self.jurisdiction.store(Arc::new(jurisdiction));
    }

    /// Resolves coordinates to a jurisdiction and adopts it when found.
    pub async fn locate_jurisdiction(&self, coordinates: Coordinates) -> LocateOutcome {
        let locator = match &self.locator {
            Capability::Available(locator) => Arc::clone(locator),
            Capability::Unavailable { reason } => {
                return LocateOutcome::Unavailable {
                    reason: reason.clone(),
                };
            }
        };

        match locator.lookup(coordinates).await {
            Some(jurisdiction) => {
                self.set_jurisdiction(&jurisdiction).await;
                LocateOutcome::Located(self.jurisdiction())
            }
            None => LocateOutcome::NotFound,
        }
    }

    async fn persist(&self) {
        self.history.save_messages(&self.store.all()).await;
    }
}
