/// Streams one exchange into its bot placeholder.
pub mod controller;
pub mod history;
pub mod instruction;
/// Conversation entities and the history they derive.
pub mod message;
pub mod orchestrator;
pub mod sentinel;
pub mod store;

pub use controller::{
    ErrorCategory, ExchangeOutcome, GENERIC_ERROR_TEXT, NETWORK_ERROR_TEXT, ResponseStreamer,
    StreamOptions,
};
pub use history::{ChatHistory, DEFAULT_HISTORY_KEY, DEFAULT_JURISDICTION_KEY};
pub use instruction::SYSTEM_INSTRUCTION;
pub use message::{
    ChatMessage, ExchangeRequest, Feedback, MessageId, RetryCommand, Sender, Source,
    derive_history,
};
pub use orchestrator::{ChatConfig, ChatOrchestrator, LocateOutcome, SendOutcome};
pub use sentinel::{SUGGESTIONS_SENTINEL, SentinelSplitter, SplitReply, parse_suggestions};
pub use store::{MessageHandle, MessageStore, Snapshot};
