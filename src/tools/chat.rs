use schemars::JsonSchema;
use serde::Deserialize;

use crate::context::FileItem;
use crate::message::Message;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ChatRequest {
    /// Conversation so far, oldest first. The last entry is the new user turn.
    /// Mention `@problems` to include editor diagnostics.
    pub messages: Vec<Message>,
    /// Files to attach. Each file over the context ceiling (default 5 KiB) is skipped.
    pub files: Option<Vec<FileItem>>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), String> {
        match self.messages.last() {
            None => Err("messages must not be empty".to_string()),
            Some(last) if last.content.trim().is_empty() => {
                Err("last message must not be empty".to_string())
            }
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_history_and_blank_turn() {
        let empty = ChatRequest {
            messages: vec![],
            files: None,
        };
        assert!(empty.validate().is_err());

        let blank = ChatRequest {
            messages: vec![Message::user("  ")],
            files: None,
        };
        assert!(blank.validate().is_err());

        let ok = ChatRequest {
            messages: vec![Message::user("hi")],
            files: None,
        };
        assert!(ok.validate().is_ok());
    }
}
