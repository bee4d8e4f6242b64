#![deny(unsafe_code)]

/// Session composition root.
pub mod app;
/// Conversation state, streaming and persistence.
pub mod chat;
pub mod repl;
/// Optional platform services such as jurisdiction lookup.
pub mod services;
/// Settings persistence.
pub mod settings;
pub mod voice;
