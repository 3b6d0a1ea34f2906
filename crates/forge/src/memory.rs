use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::errors::{ForgeError, ForgeResult};
use crate::models::message::Message;
use crate::models::role::Role;

/// Bounds on a single conversation's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Trim once a conversation holds more than this many messages
    pub cap: usize,
    /// Earliest messages always kept
    pub head: usize,
    /// Most recent messages always kept
    pub tail: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            cap: 200,
            head: 10,
            tail: 150,
        }
    }
}

impl RetentionPolicy {
    /// Reject bounds under which trimming would panic, drop the newest
    /// message, or never happen at all
    pub fn validate(&self) -> ForgeResult<()> {
        if self.cap == 0 {
            return Err(ForgeError::Configuration(
                "memory.cap must be at least 1".to_string(),
            ));
        }
        if self.tail == 0 {
            return Err(ForgeError::Configuration(
                "memory.tail must be at least 1".to_string(),
            ));
        }
        if self.head + self.tail > self.cap {
            return Err(ForgeError::Configuration(format!(
                "memory.head + memory.tail ({}) must not exceed memory.cap ({})",
                self.head + self.tail,
                self.cap
            )));
        }
        Ok(())
    }

    /// Remove the middle of an over-long history.
    ///
    /// Neither boundary may separate an assistant message from the tool
    /// results answering it: the head grows forward over trailing results and
    /// the tail start moves back to the owning assistant message. When the two
    /// windows meet, nothing is removed.
    pub fn apply(&self, messages: &mut Vec<Message>) {
        let len = messages.len();
        if len <= self.cap {
            return;
        }

        let mut head = self.head.min(len);
        while head < len && messages[head].role == Role::Tool {
            head += 1;
        }

        let mut tail = len.saturating_sub(self.tail);
        while tail > 0 && tail < len && messages[tail].role == Role::Tool {
            tail -= 1;
        }

        if tail <= head {
            return;
        }
        messages.drain(head..tail);
    }
}

/// In-process conversation history keyed by session
#[derive(Debug, Default)]
pub struct ConversationMemory {
    sessions: RwLock<HashMap<String, Vec<Message>>>,
    policy: RetentionPolicy,
}

impl ConversationMemory {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn add(&self, session: &str, message: Message) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let history = sessions.entry(session.to_string()).or_default();
        history.push(message);
        self.policy.apply(history);
    }

    /// An owned snapshot of the session's history, oldest first
    pub fn get(&self, session: &str) -> Vec<Message> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session).cloned().unwrap_or_default()
    }

    pub fn clear(&self, session: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn message_count(&self, session: &str) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session).map_or(0, Vec::len)
    }
}
