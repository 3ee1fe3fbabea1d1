//! Conversation history storage
//!
//! Keeps a bounded window of recent turns per chat so the oracle can resolve
//! follow-ups like "now put that in the Summary sheet".

use crate::models::{HistoryTurn, TurnRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// A single message in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: TurnRole,
    pub content: String,
}

impl ConversationMessage {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
        }
    }
}

/// History of one chat, oldest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: VecDeque<ConversationMessage>,
    capacity: usize,
    /// Store-local recency stamp used for eviction
    #[serde(skip)]
    last_touch: u64,
}

impl ConversationHistory {
    pub fn new(chat_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            chat_id: chat_id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            messages: VecDeque::new(),
            capacity: capacity.max(1),
            last_touch: 0,
        }
    }

    /// Append a message, evicting the oldest past capacity
    pub fn add_message(&mut self, message: ConversationMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
        self.updated_at = Utc::now();
    }

    pub fn messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Up to `count` most recent turns, oldest first
    pub fn recent_turns(&self, count: usize) -> Vec<HistoryTurn> {
        let skip = self.messages.len().saturating_sub(count);
        self.messages
            .iter()
            .skip(skip)
            .map(|m| HistoryTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }
}

pub const DEFAULT_MAX_CHATS: usize = 1000;

/// All chats, keyed by chat id. Past `max_chats`, starting a new chat evicts
/// the least recently updated one.
pub struct ConversationStore {
    chats: RwLock<HashMap<String, ConversationHistory>>,
    capacity: usize,
    max_chats: usize,
    ticks: AtomicU64,
}

impl ConversationStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_max_chats(capacity, DEFAULT_MAX_CHATS)
    }

    pub fn with_max_chats(capacity: usize, max_chats: usize) -> Self {
        Self {
            chats: RwLock::new(HashMap::new()),
            capacity,
            max_chats: max_chats.max(1),
            ticks: AtomicU64::new(0),
        }
    }

    pub async fn record(&self, chat_id: &str, role: TurnRole, content: impl Into<String>) {
        let mut chats = self.chats.write().await;
        if !chats.contains_key(chat_id) && chats.len() >= self.max_chats {
            let stalest = chats
                .values()
                .min_by_key(|h| h.last_touch)
                .map(|h| h.chat_id.clone());
            if let Some(stalest) = stalest {
                debug!(evicted = %stalest, "Conversation store full; evicting chat");
                chats.remove(&stalest);
            }
        }
        let history = chats
            .entry(chat_id.to_string())
            .or_insert_with(|| ConversationHistory::new(chat_id, self.capacity));
        history.last_touch = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        history.add_message(ConversationMessage::new(role, content));
    }

    pub async fn recent(&self, chat_id: &str, count: usize) -> Vec<HistoryTurn> {
        self.chats
            .read()
            .await
            .get(chat_id)
            .map(|h| h.recent_turns(count))
            .unwrap_or_default()
    }

    pub async fn clear(&self, chat_id: &str) -> bool {
        self.chats.write().await.remove(chat_id).is_some()
    }

    pub async fn chat_count(&self) -> usize {
        self.chats.read().await.len()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(20)
    }
}
