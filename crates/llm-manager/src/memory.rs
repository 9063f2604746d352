//! Conversation state: chat messages and the capped history kept per
//! conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

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

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Drops the oldest messages after the first one until `history` fits in
/// `cap`. The first message is the system prompt and always survives.
pub fn trim_history(history: &mut Vec<Message>, cap: usize) {
    let cap = cap.max(1);
    if history.len() <= cap {
        return;
    }
    let excess = history.len() - cap;
    history.drain(1..1 + excess);
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub model_id: String,
    pub history: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, model_id: impl Into<String>, system_prompt: &str) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            history: vec![Message::system(system_prompt)],
            created_at: Utc::now(),
        }
    }

    pub fn push(&mut self, message: Message, cap: usize) {
        self.history.push(message);
        trim_history(&mut self.history, cap);
    }

    /// Replaces the history with a single system message. The model binding
    /// is kept.
    pub fn reset(&mut self, system_prompt: &str) {
        self.history.clear();
        self.history.push(Message::system(system_prompt));
    }
}
