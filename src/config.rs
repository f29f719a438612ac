use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::GustError;
use crate::fim::FimTemplate;
use crate::provider::ProviderKind;

/// Env var naming an explicit config file path.
pub const CONFIG_PATH_ENV: &str = "GUST_CONFIG";

/// Fallback when the OS user cannot be determined.
const DEFAULT_USERNAME: &str = "gust default username";

/// Per-file ceiling for attached file context (5 KiB).
pub const DEFAULT_MAX_FILE_CONTEXT_BYTES: usize = 5 * 1024;

/// Read-only configuration surface consumed by the core.
///
/// Callers re-read `current()` per operation instead of caching, so a
/// reload published through `ConfigHandle` is picked up by the next call.
pub trait ConfigReader: Send + Sync {
    fn current(&self) -> Arc<Config>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host (and optional port) of the default backend used for seeding.
    pub hostname: String,
    pub use_tls: bool,
    pub chat_path: String,
    pub fim_path: String,
    pub provider_kind: ProviderKind,
    pub chat_model: String,
    pub fim_model: String,
    pub fim_template: FimTemplate,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Per-user identifier. Derived from the OS user when absent.
    pub username: Option<String>,
    pub tools_enabled: bool,
    pub keep_alive: Option<String>,
    /// Template whose system message prefixes every chat request.
    pub prompt_template: String,
    pub telemetry_url: Option<String>,
    pub telemetry_source: String,
    pub max_file_context_bytes: usize,
    pub stall_timeout_secs: u64,
    pub providers_path: Option<PathBuf>,
    pub template_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost:11434".to_string(),
            use_tls: false,
            chat_path: "/api/chat".to_string(),
            fim_path: "/api/generate".to_string(),
            provider_kind: ProviderKind::Ollama,
            chat_model: "codellama:7b-instruct".to_string(),
            fim_model: "codellama:7b-code".to_string(),
            fim_template: FimTemplate::CodeLlama,
            api_key: None,
            temperature: Some(0.2),
            max_tokens: Some(1024),
            username: None,
            tools_enabled: false,
            keep_alive: Some("5m".to_string()),
            prompt_template: "chat".to_string(),
            telemetry_url: None,
            telemetry_source: "gust".to_string(),
            max_file_context_bytes: DEFAULT_MAX_FILE_CONTEXT_BYTES,
            stall_timeout_secs: 120,
            providers_path: None,
            template_dir: None,
        }
    }
}

impl Config {
    pub fn from_toml(toml_str: &str) -> Result<Self, GustError> {
        toml::from_str(toml_str).map_err(|e| GustError::Config(e.to_string()))
    }

    /// Load from the config file (if any), then apply `GUST_*` env overrides.
    /// A missing or unparsable file falls back to defaults with a warning.
    pub fn load() -> Self {
        Self::load_from(config_file_path().as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Self {
        let mut config = match path {
            Some(p) if p.exists() => match std::fs::read_to_string(p)
                .map_err(|e| GustError::Config(format!("{}: {e}", p.display())))
                .and_then(|s| Self::from_toml(&s))
            {
                Ok(c) => {
                    tracing::info!(path = %p.display(), "loaded config file");
                    c
                }
                Err(e) => {
                    tracing::warn!("config file ignored: {e}");
                    Self::default()
                }
            },
            _ => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        config.ensure_username(|key| env::var(key).ok());
        config
    }

    /// Apply `GUST_*` overrides from the given lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GUST_HOSTNAME") {
            self.hostname = v;
        }
        if let Some(v) = lookup("GUST_USE_TLS") {
            self.use_tls = parse_flag(&v);
        }
        if let Some(v) = lookup("GUST_API_KEY").filter(|v| !v.is_empty()) {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("GUST_CHAT_MODEL") {
            self.chat_model = v;
        }
        if let Some(v) = lookup("GUST_FIM_MODEL") {
            self.fim_model = v;
        }
        if let Some(v) = lookup("GUST_USERNAME").filter(|v| !v.is_empty()) {
            self.username = Some(v);
        }
        if let Some(v) = lookup("GUST_ENABLE_TOOLS") {
            self.tools_enabled = parse_flag(&v);
        }
        if let Some(v) = lookup("GUST_TELEMETRY_URL") {
            self.telemetry_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("GUST_PROVIDERS_PATH") {
            self.providers_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GUST_TEMPLATE_DIR") {
            self.template_dir = Some(PathBuf::from(v));
        }
    }

    /// Fill in `username` from the OS user when the store has none.
    pub fn ensure_username(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.username.as_deref().is_some_and(|u| !u.trim().is_empty()) {
            return;
        }
        let name = lookup("USER")
            .or_else(|| lookup("USERNAME"))
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        tracing::debug!(username = %name, "derived username from OS user");
        self.username = Some(name);
    }

    pub fn protocol(&self) -> &'static str {
        if self.use_tls { "https" } else { "http" }
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(DEFAULT_USERNAME)
    }

    /// Where the provider registry is persisted.
    pub fn providers_file(&self) -> Option<PathBuf> {
        self.providers_path
            .clone()
            .or_else(|| config_dir().map(|d| d.join("providers.json")))
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("gust"))
}

fn config_file_path() -> Option<PathBuf> {
    env::var(CONFIG_PATH_ENV)
        .ok()
        .map(PathBuf::from)
        .or_else(|| config_dir().map(|d| d.join("config.toml")))
}

/// Reactive config holder. `reload()` re-reads the source and notifies
/// subscribers; readers always see the latest published snapshot.
pub struct ConfigHandle {
    tx: watch::Sender<Arc<Config>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx, path: None }
    }

    /// Load from `path` (or the default location) and remember it for reloads.
    pub fn load(path: Option<PathBuf>) -> Self {
        let path = path.or_else(config_file_path);
        let (tx, _rx) = watch::channel(Arc::new(Config::load_from(path.as_deref())));
        Self { tx, path }
    }

    pub fn reload(&self) {
        let config = Config::load_from(self.path.as_deref());
        self.replace(config);
    }

    pub fn replace(&self, config: Config) {
        self.tx.send_replace(Arc::new(config));
        tracing::info!("configuration changed");
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }
}

impl ConfigReader for ConfigHandle {
    fn current(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }
}
