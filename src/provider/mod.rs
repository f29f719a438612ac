pub mod registry;
pub mod store;

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dispatch::RequestOptions;
use crate::fim::FimTemplate;

/// Backend family. Selects the wire payload shape and capability set.
///
/// Unknown tags deserialize to `Generic`, which always maps to the minimal
/// payload shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    OpenWebUi,
    LlamaCpp,
    LmStudio,
    LiteLlm,
    OpenAi,
    Deepseek,
    CustomOpenAi,
    #[default]
    #[serde(other)]
    Generic,
}

/// Which request mode a payload is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Chat,
    Fim,
}

/// Where a kind expects the token limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLimitField {
    MaxTokens,
    NPredict,
    /// `options.num_predict`, alongside `options.temperature`.
    OptionsNumPredict,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 9] = [
        Self::Ollama,
        Self::OpenWebUi,
        Self::LlamaCpp,
        Self::LmStudio,
        Self::LiteLlm,
        Self::OpenAi,
        Self::Deepseek,
        Self::CustomOpenAi,
        Self::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenWebUi => "openwebui",
            Self::LlamaCpp => "llamacpp",
            Self::LmStudio => "lmstudio",
            Self::LiteLlm => "litellm",
            Self::OpenAi => "openai",
            Self::Deepseek => "deepseek",
            Self::CustomOpenAi => "customopenai",
            Self::Generic => "generic",
        }
    }

    pub fn token_limit_field(&self, mode: RequestMode) -> TokenLimitField {
        match (self, mode) {
            (Self::Ollama | Self::OpenWebUi, _) => TokenLimitField::OptionsNumPredict,
            (Self::LlamaCpp, _) => TokenLimitField::NPredict,
            (Self::Generic, RequestMode::Fim) => TokenLimitField::NPredict,
            _ => TokenLimitField::MaxTokens,
        }
    }

    /// Whether tool declarations are forwarded at all.
    pub fn supports_tools(&self) -> bool {
        matches!(
            self,
            Self::Ollama | Self::OpenAi | Self::Deepseek | Self::LiteLlm | Self::CustomOpenAi
        )
    }

    /// Whether the backend can stream while tool declarations are attached.
    pub fn streams_with_tools(&self) -> bool {
        matches!(self, Self::OpenAi | Self::Deepseek)
    }

    /// Prompt-mode requests that must still be sent as a chat message.
    pub fn wraps_prompt_in_messages(&self) -> bool {
        matches!(self, Self::LiteLlm)
    }

    pub fn sends_model(&self) -> bool {
        !matches!(self, Self::LlamaCpp)
    }

    pub fn sends_keep_alive(&self) -> bool {
        matches!(self, Self::Ollama | Self::OpenWebUi)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a provider can be active for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    Chat,
    Fim,
}

impl ProviderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Fim => "fim",
        }
    }
}

/// A named backend configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderConfig {
    /// Registry-assigned identifier. Ignored on `add`.
    #[serde(default)]
    pub id: String,
    pub label: String,
    /// Host with optional port, e.g. `localhost:11434`.
    pub hostname: String,
    /// Request path, e.g. `/v1/chat/completions`.
    pub path: String,
    /// `http` or `https`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub role: ProviderRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fim_template: Option<FimTemplate>,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl ProviderConfig {
    /// Seed provider for chat, built from the configured default endpoint.
    pub fn default_chat(config: &Config) -> Self {
        Self {
            id: String::new(),
            label: format!("{} chat", config.provider_kind),
            hostname: config.hostname.clone(),
            path: config.chat_path.clone(),
            protocol: config.protocol().to_string(),
            kind: config.provider_kind,
            model: config.chat_model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            role: ProviderRole::Chat,
            fim_template: None,
        }
    }

    /// Seed provider for fill-in-the-middle completion.
    pub fn default_fim(config: &Config) -> Self {
        Self {
            id: String::new(),
            label: format!("{} fim", config.provider_kind),
            hostname: config.hostname.clone(),
            path: config.fim_path.clone(),
            protocol: config.protocol().to_string(),
            kind: config.provider_kind,
            model: config.fim_model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            role: ProviderRole::Fim,
            fim_template: Some(config.fim_template),
        }
    }

    /// Logical request target for this provider.
    pub fn request_options(&self) -> RequestOptions {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            headers.insert("Authorization".to_string(), format!("Bearer {key}"));
        }
        RequestOptions {
            hostname: self.hostname.clone(),
            path: self.path.clone(),
            protocol: self.protocol.clone(),
            method: "POST".to_string(),
            headers,
            provider: self.label.clone(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("hostname", &self.hostname)
            .field("path", &self.path)
            .field("protocol", &self.protocol)
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("role", &self.role)
            .field("fim_template", &self.fim_template)
            .finish()
    }
}
