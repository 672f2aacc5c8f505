//! Watchdog entry point. Supervises a message-agent host process,
//! restarting it when the heartbeat goes stale.
//!
//! Exit codes: 0 on graceful shutdown, 1 on fatal initialisation error.

use message_agent::watchdog::{Watchdog, WatchdogConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = match WatchdogConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("watchdog initialisation failed: {error}");
            std::process::exit(1);
        }
    };

    let mut watchdog = Watchdog::new(config);
    tokio::select! {
        _ = watchdog.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("watchdog shutting down");
        }
    }
}
