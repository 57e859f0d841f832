//! portguard-agent: the daemon a chat transport talks to
//!
//! Responsibilities:
//! - Load configuration from /etc/portguard/config.toml
//! - Detect the firewall backend once and build the guard context
//! - Serve the operation API and the event stream
//! - Optionally start the monitoring loop
//! - Handle shutdown signals

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portguard::exec::SystemRunner;
use portguard::events::EventSeverity;
use portguard::PortGuard;

mod api;
mod config;

use config::ConfigSource;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, source) = config::load_config()?;
    init_logging(&config.system.log_level)?;

    info!("portguard-agent v{} starting...", env!("CARGO_PKG_VERSION"));
    match &source {
        ConfigSource::File(path) => info!("Configuration loaded from {}", path.display()),
        ConfigSource::Defaults(path) => {
            warn!("Config file not found at {}, using defaults", path.display())
        }
    }
    if config.privilege.escalation.is_empty() {
        info!("Privileged commands run directly");
    } else {
        info!(
            "Privileged commands run through `{}`",
            config.privilege.escalation.join(" ")
        );
    }

    let runner = Arc::new(SystemRunner::new(config.privilege.escalation.clone()));
    let guard = Arc::new(PortGuard::new(runner, config.guard).await);

    let cancel = CancellationToken::new();
    let log_task = tokio::spawn(log_events(guard.clone(), cancel.clone()));

    if guard.settings().monitor.autostart {
        let result = guard.start_monitoring();
        info!("{}", result.detail);
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    api::serve(guard.clone(), &config.api.listen_address, cancel.clone())
        .await
        .context("Operation API failed")?;

    if guard.monitoring() {
        guard.stop_monitoring().await;
    }
    cancel.cancel();
    let _ = log_task.await;

    info!("portguard-agent stopped");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .init();
    Ok(())
}

/// Mirror guard events into the log so they survive without a connected
/// transport.
async fn log_events(guard: Arc<PortGuard>, cancel: CancellationToken) {
    let mut events = guard.events().subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let Ok(json) = serde_json::to_string(&event.payload) else {
                    continue;
                };
                match event.severity {
                    EventSeverity::Info => info!("event: {json}"),
                    EventSeverity::Warning | EventSeverity::Critical => warn!("event: {json}"),
                }
            }
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
