use thiserror::Error;

/// Prefix for error text delivered through the completion-end channel.
/// The UI styles any completion starting with this marker as an error.
pub const ERROR_MARKER: &str = "==## ERROR ##== : ";

#[derive(Debug, Error)]
pub enum GustError {
    #[error("no active {role} provider")]
    NoActiveProvider { role: &'static str },

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("provider store error: {0}")]
    Store(String),
}

impl GustError {
    /// Sanitized message safe to show in the chat panel.
    /// Does not leak API keys, request URLs or connection internals.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoActiveProvider { role } => format!("no active {role} provider is configured"),
            Self::ProviderNotFound(id) => format!("provider not found: {id}"),
            Self::TemplateNotFound(name) => format!("template not found: {name}"),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::Upstream {
                provider, message, ..
            } => format!("upstream error from {provider}: {message}"),
            Self::AuthFailed { provider, message } => {
                format!("authentication failed for {provider}: {message}")
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(e) if e.is_connect() => "could not connect to provider".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Store(msg) => format!("provider store error: {msg}"),
        }
    }

    /// The text published to the UI when this error ends a stream.
    pub fn to_completion_text(&self) -> String {
        format!("{ERROR_MARKER}{}", self.user_message())
    }
}
