//! Conversation memory
//!
//! Per-chat history handed to the NLU oracle as context

pub mod store;

pub use store::{ConversationHistory, ConversationMessage, ConversationStore};
