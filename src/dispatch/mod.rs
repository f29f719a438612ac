pub mod body;
pub mod decode;
pub mod functions;
pub mod stream;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dispatch::functions::FunctionTool;
use crate::message::{Message, Role};

/// Provider-agnostic request target. Built fresh per call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub hostname: String,
    pub path: String,
    pub protocol: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Provider label for error attribution and logs.
    pub provider: String,
}

impl RequestOptions {
    /// `{protocol}://{hostname}{path}`. A hostname that already carries a
    /// scheme is used as-is.
    pub fn url(&self) -> String {
        let host = self.hostname.trim_end_matches('/');
        let path = if self.path.is_empty() || self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        if host.contains("://") {
            format!("{host}{path}")
        } else {
            let protocol = if self.protocol.is_empty() {
                "http"
            } else {
                self.protocol.trim_end_matches("://").trim_end_matches(':')
            };
            format!("{protocol}://{host}{path}")
        }
    }
}

/// Chat turns or a single prompt (fill-in-the-middle).
#[derive(Debug, Clone, PartialEq)]
pub enum RequestInput {
    Messages(Vec<Message>),
    Prompt(String),
}

/// Logical request options handed to the body builder.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParams {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub keep_alive: Option<String>,
    pub stop: Option<Vec<String>>,
    pub input: RequestInput,
}

/// Message as sent on the wire: role and content only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}

/// Sampling options nested under `options` for Ollama-style backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

/// Wire payload. Which fields are present is decided by the provider kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<WireMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ModelOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<FunctionTool>>,
}

/// Token usage reported by the backend, when present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Fragment of a tool invocation. Streaming backends split one call across
/// several records keyed by `index`; `arguments` is raw JSON text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// One decoded stream record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialResult {
    pub content: String,
    pub tool_calls: Vec<ToolCallDelta>,
    pub done: bool,
    pub usage: Option<Usage>,
}

impl PartialResult {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(hostname: &str, path: &str, protocol: &str) -> RequestOptions {
        RequestOptions {
            hostname: hostname.to_string(),
            path: path.to_string(),
            protocol: protocol.to_string(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            provider: "test".to_string(),
        }
    }

    #[test]
    fn url_joins_parts() {
        assert_eq!(
            opts("localhost:11434", "/api/chat", "http").url(),
            "http://localhost:11434/api/chat"
        );
        assert_eq!(
            opts("api.example.com", "v1/completions", "https").url(),
            "https://api.example.com/v1/completions"
        );
    }

    #[test]
    fn url_tolerates_scheme_in_hostname() {
        assert_eq!(
            opts("http://llm.lan/", "/v1/chat/completions", "http").url(),
            "http://llm.lan/v1/chat/completions"
        );
    }
}
