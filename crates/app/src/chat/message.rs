use std::fmt;
use std::str::FromStr;

use lexi_llm::{Citation, HistoryTurn, ImageAttachment, TurnRole};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for one message; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Fixed id of the seed welcome message.
    pub const SEED: Self = Self(Uuid::nil());

    pub const fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn is_seed(&self) -> bool {
        *self == Self::SEED
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// One-shot rating of a bot reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Up,
    Down,
}

/// Well-formed grounding citation shown under a completed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub uri: String,
    pub title: String,
}

impl Source {
    pub fn from_citation(citation: Citation) -> Option<Self> {
        citation.is_well_formed().then(|| Self {
            uri: citation.uri,
            title: citation.title,
        })
    }
}

/// Everything needed to replay one exchange exactly as it was first sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRequest {
    pub text: String,
    pub image: Option<ImageAttachment>,
    pub jurisdiction: String,
    pub history: Vec<HistoryTurn>,
}

impl ExchangeRequest {
    /// The utterance sent to the model, prefixed with the jurisdiction when one is set.
    pub fn prompt(&self) -> String {
        let jurisdiction = self.jurisdiction.trim();
        if jurisdiction.is_empty() {
            self.text.clone()
        } else {
            format!("Jurisdiction: {jurisdiction}\n\nUser Question: {}", self.text)
        }
    }
}

/// Re-invocable command attached to a failed bot message.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryCommand {
    pub message_id: MessageId,
    pub request: ExchangeRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub text: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_loading: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
    #[serde(skip)]
    pub retry_request: Option<RetryCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
}

impl ChatMessage {
    fn new(id: MessageId, sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            sender,
            image: None,
            is_loading: false,
            is_error: false,
            retry_request: None,
            feedback: None,
            suggestions: None,
            sources: None,
        }
    }

    pub fn seed(welcome: impl Into<String>) -> Self {
        Self::new(MessageId::SEED, Sender::Bot, welcome)
    }

    pub fn user(text: impl Into<String>, image: Option<ImageAttachment>) -> Self {
        let mut message = Self::new(MessageId::new_v7(), Sender::User, text);
        message.image = image;
        message
    }

    /// Empty bot message that receives streamed output.
    pub fn placeholder(id: MessageId) -> Self {
        let mut message = Self::new(id, Sender::Bot, String::new());
        message.is_loading = true;
        message
    }

    /// Resets a message to the placeholder shape, keeping its id and sender.
    pub fn reset_to_placeholder(&mut self) {
        *self = Self::placeholder(self.id);
    }

    pub fn is_user(&self) -> bool {
        self.sender == Sender::User
    }

    /// Whether this message is part of the history sent with the next exchange.
    pub fn counts_as_history(&self) -> bool {
        !self.id.is_seed() && !self.is_loading && !self.is_error && !self.text.is_empty()
    }

    pub fn as_history_turn(&self) -> HistoryTurn {
        let role = match self.sender {
            Sender::User => TurnRole::User,
            Sender::Bot => TurnRole::Model,
        };
        HistoryTurn::new(role, self.text.clone())
    }
}

/// History for a new exchange, oldest first.
pub fn derive_history(messages: &[ChatMessage]) -> Vec<HistoryTurn> {
    messages
        .iter()
        .filter(|message| message.counts_as_history())
        .map(ChatMessage::as_history_turn)
        .collect()
}

fn is_false(value: &bool) -> bool {
    !*value
}
