use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sqlchat_adapters::http_client::HttpGenerationBackend;
use sqlchat_adapters::secrets::{resolve_api_key, ApiKeySource};
use sqlchat_adapters::server;
use sqlchat_core::chat_session::{ChatSession, SessionOptions};
use sqlchat_core::conversation_store::ConversationStore;
use sqlchat_core::message_view::PresentationVariant;
use sqlchat_core::persistence::{default_state_path, FileStatePersistence};
use sqlchat_core::settings::{
    default_log_path, default_settings_path, ClientSettings, EndpointKind, ProxySettings,
    API_KEY_VAR,
};
use sqlchat_tui::ChatScreenOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sqlchat", version, about = "Ask questions about your database in plain language")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Run the proxy that adds the API key and connection id to requests.
    Serve {
        /// Address to listen on; overrides SQLCHAT_BIND_ADDR.
        #[arg(long)]
        bind: Option<String>,
        /// Read the API key from the OS keyring, saving TEXT2SQL_API_KEY there when missing.
        #[arg(long)]
        api_key_from_keyring: bool,
    },
    /// Open the terminal chat (default).
    Chat {
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Conversation state file.
        #[arg(long)]
        state: Option<PathBuf>,
        #[arg(long, value_enum)]
        variant: Option<VariantArg>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VariantArg {
    Compact,
    Table,
}

impl From<VariantArg> for PresentationVariant {
    fn from(value: VariantArg) -> Self {
        match value {
            VariantArg::Compact => Self::Compact,
            VariantArg::Table => Self::Table,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChatConfig {
    settings: ClientSettings,
    state_path: PathBuf,
}

fn run_app(
    cli: Cli,
    serve: impl FnOnce(ProxySettings) -> anyhow::Result<()>,
    chat: impl FnOnce(ChatConfig) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Chat {
        settings: None,
        state: None,
        variant: None,
    }) {
        Command::Serve {
            bind,
            api_key_from_keyring,
        } => {
            let mut settings = ProxySettings::from_env();
            if let Some(bind) = bind {
                settings.bind_addr = bind;
            }
            let source = if api_key_from_keyring {
                ApiKeySource::Keyring
            } else {
                ApiKeySource::EnvVar
            };
            settings.api_key = resolve_api_key(source, settings.api_key.take());
            serve(settings)
        }
        Command::Chat {
            settings,
            state,
            variant,
        } => {
            let settings_path = match settings {
                Some(path) => path,
                None => default_settings_path()?,
            };
            let mut settings = ClientSettings::load_from_path(&settings_path)?;
            if let Some(variant) = variant {
                settings.variant = variant.into();
            }
            let state_path = match state {
                Some(path) => path,
                None => default_state_path()?,
            };
            chat(ChatConfig {
                settings,
                state_path,
            })
        }
    }
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

fn serve_proxy(settings: ProxySettings) -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(server::serve(settings, async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for shutdown signal");
        }
    }))?;
    Ok(())
}

/// Logs go to a file so they do not draw over the terminal UI.
fn init_chat_logging() {
    let Ok(log_path) = default_log_path() else {
        return;
    };
    if let Some(parent_dir) = log_path.parent() {
        if fs::create_dir_all(parent_dir).is_err() {
            return;
        }
    }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
}

fn run_chat(config: ChatConfig) -> anyhow::Result<()> {
    init_chat_logging();

    let settings = config.settings;
    let base_url = settings.resolved_base_url().to_string();
    let backend = match settings.endpoint {
        EndpointKind::Proxy => HttpGenerationBackend::via_proxy(&base_url),
        EndpointKind::Direct => {
            HttpGenerationBackend::direct(&base_url, std::env::var(API_KEY_VAR).ok())
        }
    };
    tracing::info!(endpoint = backend.endpoint(), "starting chat");

    let store = Arc::new(ConversationStore::restore(FileStatePersistence::from_path(
        config.state_path,
    )));
    let session = Arc::new(ChatSession::new(
        store,
        backend,
        SessionOptions {
            connection_id: settings.connection_id.clone(),
            run_on_send: settings.variant.runs_on_send(),
        },
    ));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let export_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    sqlchat_tui::run(
        session,
        runtime.handle().clone(),
        ChatScreenOptions::from_settings(&settings, export_dir),
    )?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    run_app(Cli::parse(), serve_proxy, run_chat)
}
