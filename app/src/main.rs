// In app/src/main.rs

use self::tracing_layer::WsBroadcastLayer;
use anyhow::{Context, Result};
use api_client::LiveConnector;
use app_config::Settings;
use clap::{Parser, Subcommand};
use core_types::Symbol;
use engine::SessionController;
use events::WsMessage;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use strategies::{FileStrategyStore, StrategyValidator};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::prelude::*;
use web_server::AppState;

mod tracing_layer;

// --- Command-Line Interface Definition ---

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = "Streams exchange market data through declarative strategies and simulates the resulting trades.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the session API and the outbound event stream.
    Run,

    /// Validates a strategy file (JSON or TOML) and prints the result.
    Validate {
        /// Path to the strategy file.
        file: PathBuf,
    },

    /// Runs a single headless session until Ctrl-C, printing its events.
    Watch {
        /// The trading symbol (e.g., "BTCUSDT").
        #[arg(short, long)]
        symbol: String,

        /// The strategy id, looked up in the configured strategy directory.
        #[arg(long)]
        strategy: String,
    },
}

// --- Main Application Entry Point ---

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a .env file, if it exists.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // `validate` works without a config directory.
    let settings = match (&cli.command, app_config::load_settings()) {
        (_, Ok(settings)) => Some(settings),
        (Commands::Validate { .. }, Err(_)) => None,
        (_, Err(e)) => return Err(e).context("failed to load settings"),
    };

    let (ws_tx, _) = broadcast::channel::<WsMessage>(1024);
    let level = settings
        .as_ref()
        .and_then(|s| tracing::Level::from_str(&s.app.log_level).ok())
        .unwrap_or(tracing::Level::INFO);
    init_tracing(level, ws_tx.clone());

    match (cli.command, settings) {
        (Commands::Run, Some(settings)) => run_app(settings, ws_tx).await?,
        (Commands::Validate { file }, settings) => handle_validate(&file, settings.as_ref())?,
        (Commands::Watch { symbol, strategy }, Some(settings)) => handle_watch(settings, ws_tx, &symbol, &strategy).await?,
        (_, None) => anyhow::bail!("settings are required for this command"),
    }

    Ok(())
}

fn init_tracing(level: tracing::Level, ws_tx: broadcast::Sender<WsMessage>) {
    let ws_layer = WsBroadcastLayer::new(ws_tx, tracing::Level::INFO);
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(
        tracing_subscriber::filter::Targets::new()
            .with_target("tungstenite", tracing::Level::WARN)
            .with_target("tokio_tungstenite", tracing::Level::WARN)
            .with_target("tower_http", tracing::Level::INFO)
            .with_default(level),
    );
    tracing_subscriber::registry().with(fmt_layer).with(ws_layer).init();
}

fn build_controller(settings: Settings, ws_tx: broadcast::Sender<WsMessage>) -> Arc<SessionController> {
    let store = FileStrategyStore::new(&settings.strategies.dir);
    let source = LiveConnector::new(&settings);
    Arc::new(SessionController::new(Arc::new(settings), Arc::new(store), Arc::new(source), ws_tx))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C.");
        std::future::pending::<()>().await;
    }
}

// --- "Run" Subcommand Logic ---

/// Serves the session API until Ctrl-C, then stops every session.
async fn run_app(settings: Settings, ws_tx: broadcast::Sender<WsMessage>) -> Result<()> {
    tracing::info!(environment = %settings.app.environment, "Application settings loaded successfully.");
    let host = settings.server.host.clone();
    let port = settings.server.port;
    let controller = build_controller(settings, ws_tx);

    web_server::run(&host, port, AppState::new(controller.clone()), shutdown_signal()).await?;

    let stopped = controller.stop_all().await;
    tracing::info!(sessions = stopped.len(), "All sessions stopped. Goodbye.");
    Ok(())
}

// --- "Validate" Subcommand Logic ---

fn handle_validate(file: &std::path::Path, settings: Option<&Settings>) -> Result<()> {
    let validator = settings
        .map(|s| StrategyValidator::from_allowlist(&s.strategies.allowed_indicators))
        .unwrap_or_default();
    let raw = FileStrategyStore::load_path(file).with_context(|| format!("failed to read {}", file.display()))?;

    match validator.validate(&raw) {
        Ok(definition) => {
            println!("Strategy '{}' is valid.", definition.id);
            println!("  fingerprint: {}", definition.fingerprint);
            for section in definition.sections().filter(|s| !s.is_empty()) {
                println!("  {}: {} condition(s), {}", section.id, section.conditions.len(), section.logic.as_str());
            }
            Ok(())
        }
        Err(strategies::Error::Validation(failure)) => {
            println!("Strategy '{}' is invalid ({}):", failure.strategy_id, failure.fingerprint);
            for issue in &failure.issues {
                println!("  - {}", issue);
            }
            anyhow::bail!("{} validation issue(s)", failure.issues.len())
        }
        Err(e) => Err(e.into()),
    }
}

// --- "Watch" Subcommand Logic ---

/// Runs one session and prints every state change, fill and health event
/// as a JSON line until Ctrl-C.
async fn handle_watch(settings: Settings, ws_tx: broadcast::Sender<WsMessage>, symbol: &str, strategy: &str) -> Result<()> {
    let mut rx = ws_tx.subscribe();
    let controller = build_controller(settings, ws_tx);
    let session_id = controller.start(Symbol::new(symbol), strategy).await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = rx.recv() => match received {
                Ok(WsMessage::Log(_)) => {}
                Ok(message) => println!("{}", serde_json::to_string(&message)?),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event printer lagged."),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let view = controller.stop(&session_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
