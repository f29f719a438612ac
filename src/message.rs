use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Approval state of a requested tool invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// A tool invocation requested by the model. Never executed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub status: ToolStatus,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            id: None,
            tools: None,
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

/// Ordered turn history with edit operations that keep user/assistant
/// alternation intact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop the turn at `index` and everything after it, so the preceding
    /// user turn can be answered again.
    pub fn regenerate(&mut self, index: usize) {
        self.messages.truncate(index);
    }

    /// Replace the content of the turn at `index` and discard later turns.
    pub fn edit(&mut self, index: usize, content: impl Into<String>) -> bool {
        let Some(message) = self.messages.get_mut(index) else {
            return false;
        };
        message.content = content.into();
        self.messages.truncate(index + 1);
        true
    }

    /// Remove the exchange starting at `index` (the turn and its reply).
    /// A conversation holding a single exchange is left untouched.
    pub fn delete(&mut self, index: usize) -> bool {
        if self.messages.len() <= 2 || index >= self.messages.len() {
            return false;
        }
        let end = (index + 2).min(self.messages.len());
        self.messages.drain(index..end);
        true
    }

    /// Optional leading system message, then strictly alternating
    /// user/assistant turns starting with a user turn.
    pub fn is_well_formed(&self) -> bool {
        let turns = match self.messages.first() {
            Some(m) if m.role == Role::System => &self.messages[1..],
            _ => &self.messages[..],
        };
        turns.iter().enumerate().all(|(i, m)| {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            m.role == expected
        })
    }
}
