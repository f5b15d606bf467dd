//! Conversation transcript shared by the user and assistant context aggregators.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message, in the shape chat-completion APIs expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A transcript entry with the time it was committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    #[serde(flatten)]
    pub message: Message,
    pub timestamp: DateTime<Utc>,
}

/// Ordered, append-only turn history.
///
/// Cloning yields another handle to the same transcript. Writes come from the
/// aggregator roles only; readers take whole snapshots under the lock.
#[derive(Debug, Clone)]
pub struct Transcript {
    entries: Arc<RwLock<Vec<TranscriptEntry>>>,
}

impl Transcript {
    /// Create a transcript whose first entry is the system prompt.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let first = TranscriptEntry {
            message: Message::new(Role::System, system_prompt),
            timestamp: Utc::now(),
        };
        Self {
            entries: Arc::new(RwLock::new(vec![first])),
        }
    }

    pub fn append(&self, role: Role, content: impl Into<String>) {
        let entry = TranscriptEntry {
            message: Message::new(role, content),
            timestamp: Utc::now(),
        };
        // A poisoned lock still holds a consistent Vec; keep appending.
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
    }

    /// Messages in chronological order, copied out under a single read lock.
    pub fn snapshot(&self) -> Vec<Message> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, role: Role) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.message.role == role)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
