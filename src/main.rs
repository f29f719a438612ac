use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};

use gust::chat::ChatService;
use gust::config::{ConfigHandle, ConfigReader};
use gust::events::LogSink;
use gust::provider::registry::ProviderRegistry;
use gust::provider::store::{JsonFileStore, MemoryProviderStore, ProviderStore};
use gust::server::GustServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // MCP servers may start with any CWD; prefer the .env next to the binary.
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join(".env")))
        .filter(|p| p.exists());
    match beside_exe {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("gust starting");

    let config = Arc::new(ConfigHandle::load(None));
    let store: Arc<dyn ProviderStore> = match config.current().providers_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "persisting providers");
            Arc::new(JsonFileStore::new(path))
        }
        None => {
            tracing::warn!("no config directory, providers kept in memory");
            Arc::new(MemoryProviderStore::new())
        }
    };
    let registry = Arc::new(ProviderRegistry::open(store, config.clone()));
    let chat = Arc::new(ChatService::new(registry, config.clone(), Arc::new(LogSink)));

    #[cfg(unix)]
    spawn_reload_on_hangup(config.clone())?;

    let server = GustServer::new(chat);
    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("gust shutting down");
    Ok(())
}

/// SIGHUP re-reads the config file and environment.
#[cfg(unix)]
fn spawn_reload_on_hangup(config: Arc<ConfigHandle>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            config.reload();
        }
    });
    Ok(())
}
