#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Composition root: loads configuration, wires the store, ledger,
//! notification service and bot supervisor together, warms up bots for
//! every project that has one configured, and serves the webhook ingress.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use bonuslayer::config::Config;
use bonuslayer::ledger::LedgerEngine;
use bonuslayer::logging::{self, LoggingGuard};
use bonuslayer::notification::{EmailChannel, NotificationChannel, NotificationService, PushChannel, SmsChannel};
use bonuslayer::store::Store;
use bonuslayer::supervisor::{Supervisor, SupervisorTelegramChannel};
use bonuslayer::webhook::{self, WebhookState};

/// Default directory for rotating JSON log files.
const DEFAULT_LOGS_DIR: &str = "logs";

/// Multi-tenant loyalty/bonus engine server.
#[derive(Parser)]
#[command(name = "bonuslayer", version, about)]
struct Cli {
    /// Path to the TOML config file (overrides `BONUSLAYER_CONFIG_PATH`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Force console-only logging, even in production.
    #[arg(long)]
    console_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load a local `.env` if present so `DB_URL`/`LOG_LEVEL`/etc. can be set
    // without exporting them into the shell. Absence of a `.env` is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var("BONUSLAYER_CONFIG_PATH", path);
    }

    let config = Config::load().context("failed to load configuration")?;
    let _logging_guard = init_logging(&config, cli.console_logs)?;

    info!("bonuslayer starting");

    let store = Store::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to database")?;

    let prefers_polling = config.prefers_polling();
    let public_app_url = config.server.public_app_url.clone();

    // The supervisor, ledger and notification service form a reference
    // cycle (supervisor owns the ledger, the ledger's notifier routes
    // through the supervisor's workers); `Arc::new_cyclic` lets the
    // notification channel hold a `Weak` back-reference instead.
    let supervisor = Arc::new_cyclic(|weak_supervisor| {
        let telegram_channel: Arc<dyn NotificationChannel> = Arc::new(SupervisorTelegramChannel::new(weak_supervisor.clone()));
        let channels: Vec<Arc<dyn NotificationChannel>> =
            vec![telegram_channel, Arc::new(EmailChannel), Arc::new(SmsChannel), Arc::new(PushChannel)];
        let notifier = Arc::new(NotificationService::new(store.clone(), channels));
        let ledger = Arc::new(LedgerEngine::new(store.clone(), notifier));
        Supervisor::new(store.clone(), ledger, public_app_url, prefers_polling)
    });

    warm_up_bots(&store, &supervisor).await;

    let state = WebhookState { store: store.clone(), ledger: supervisor.ledger(), supervisor: Arc::clone(&supervisor) };
    let app = webhook::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind HTTP listener")?;
    info!(%addr, "webhook ingress listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("HTTP server error")?;

    supervisor.emergency_stop_all().await;
    info!("bonuslayer shut down");
    Ok(())
}

/// Start a [`bonuslayer::bot::BotWorker`] for every project that already
/// has an active bot configured, so a restart resumes delivery without an
/// external admin call.
async fn warm_up_bots(store: &Store, supervisor: &Arc<Supervisor>) {
    let settings = match store.list_active_bot_settings().await {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "failed to load bot settings at startup");
            return;
        }
    };

    for setting in settings {
        let project_id = setting.project_id;
        if let Err(e) = supervisor.create_bot(project_id, &setting).await {
            warn!(%project_id, error = %e, "failed to start bot at startup");
        }
    }
}

/// Initialise logging per [`bonuslayer::config::LoggingConfig`]: JSON file
/// output under [`DEFAULT_LOGS_DIR`], plus console output when requested
/// either on the CLI or in config.
fn init_logging(config: &Config, force_console: bool) -> anyhow::Result<LoggingGuard> {
    let enable_console = force_console || config.logging.enable_console_logs;
    logging::init_production(std::path::Path::new(DEFAULT_LOGS_DIR), &config.logging.log_level, enable_console)
}

/// Resolves once SIGINT (or, on Unix, SIGTERM) is received, so `main` can
/// run `emergencyStopAll` before the process exits (spec §4.7 "On shutdown
/// signals the supervisor runs emergencyStopAll then exits with code 0").
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("shutdown signal received");
}
