//! Typed messages crossing the UI boundary.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::FileItem;
use crate::message::{Message, Role, ToolCall};
use crate::provider::registry::ProviderEntry;
use crate::provider::{ProviderConfig, ProviderRole};

/// Core → UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum UiEvent {
    /// Accumulated assistant text so far, leading whitespace trimmed.
    CompletionChunk { content: String, role: Role },
    CompletionEnd {
        content: String,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Vec<ToolCall>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// The model asked to run tools; the UI decides.
    AwaitingToolApproval { message: Message },
    Loading { message: String },
    Generating { active: bool },
    LanguageInfo { language: String },
    AddMessage { content: String },
    Providers { providers: Vec<ProviderEntry> },
    ActiveProvider {
        role: ProviderRole,
        provider: Option<ProviderConfig>,
    },
}

/// UI → core.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum UiCommand {
    ChatMessage {
        messages: Vec<Message>,
        #[serde(default)]
        mentions: Vec<FileItem>,
    },
    StopGeneration,
    NewConversation,
    GetAllProviders,
    GetActiveProvider { role: ProviderRole },
    SetActiveProvider { role: ProviderRole, id: String },
    AddProvider { provider: ProviderConfig },
    UpdateProvider { provider: ProviderConfig },
    RemoveProvider { id: String },
    CopyProvider { id: String },
    ResetProviders,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: UiEvent);
}

/// Forwards events to an unbounded tokio channel. A dropped receiver turns
/// emits into no-ops.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("ui event dropped: receiver closed");
        }
    }
}

/// Writes events to the log. Used when no UI is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: UiEvent) {
        match &event {
            UiEvent::CompletionChunk { content, .. } => {
                tracing::trace!(len = content.len(), "completion chunk");
            }
            UiEvent::CompletionEnd { content, tools, .. } => {
                tracing::info!(
                    len = content.len(),
                    tools = tools.as_ref().map_or(0, Vec::len),
                    "completion end"
                );
            }
            UiEvent::AwaitingToolApproval { message } => {
                tracing::info!(
                    tools = message.tools.as_ref().map_or(0, Vec::len),
                    "awaiting tool approval"
                );
            }
            other => tracing::debug!(event = ?other, "ui event"),
        }
    }
}
