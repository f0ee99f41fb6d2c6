use std::path::PathBuf;
use std::sync::Arc;

use a3s_audit::{AuditError, AuditSettings, AuditTrail, MongoSource, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "a3s-audit",
    about = "a3s-audit — change-feed audit trail for MongoDB"
)]
struct Cli {
    /// Connection string of the watched deployment
    #[arg(long, env = "MONGODB_URI")]
    uri: Option<String>,

    /// Database to watch
    #[arg(long, env = "AUDIT_DATABASE")]
    database: Option<String>,

    /// JSON settings file (tracking, sensitive fields, options)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "a3s-audit exited with an error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = match &cli.config {
        Some(path) => AuditSettings::from_file(path)?,
        None => AuditSettings::default(),
    };
    if let Some(uri) = cli.uri {
        settings.target.uri = uri;
    }
    if let Some(database) = cli.database {
        settings.target.database = database;
    }

    // Listen before startup so a signal during connection retries still
    // takes the orderly shutdown path
    let token = CancellationToken::new();
    install_panic_hook(token.clone());
    let signals = tokio::spawn(cancel_on_signal(token.clone()));

    let source = MongoSource::new().with_audit_schema(settings.audit_collection.clone());
    let started = AuditTrail::start_with_token(Arc::new(source), settings, token.clone()).await;
    let trail = match started {
        Ok(trail) => trail,
        Err(AuditError::Shutdown(reason)) if token.is_cancelled() => {
            tracing::info!(reason = %reason, "Stopped during startup");
            signals.abort();
            return Ok(());
        }
        Err(e) => {
            signals.abort();
            return Err(e);
        }
    };

    token.cancelled().await;
    signals.abort();

    let stats = trail.stats();
    trail.shutdown().await?;
    tracing::info!(
        received = stats.events_received,
        persisted = stats.records_persisted,
        dropped = stats.records_dropped,
        recoveries = stats.recoveries,
        "Audit trail finished"
    );
    Ok(())
}

async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        signal = wait_for_signal() => {
            tracing::info!(signal, "Signal received, shutting down");
            token.cancel();
        }
        _ = token.cancelled() => {
            tracing::warn!("Shutdown requested internally");
        }
    }
}

/// A panic anywhere takes the same shutdown path as a signal
fn install_panic_hook(token: CancellationToken) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        token.cancel();
    }));
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut terminate), Ok(mut quit)) =
        (signal(SignalKind::terminate()), signal(SignalKind::quit()))
    else {
        tracing::warn!("Could not install SIGTERM/SIGQUIT handlers, listening for SIGINT only");
        tokio::signal::ctrl_c().await.ok();
        return "SIGINT";
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    tokio::signal::ctrl_c().await.ok();
    "SIGINT"
}
