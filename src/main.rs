//! OCPP station emulator process entry point.
//!
//! Loads `EmulatorConfig` (TOML, default `~/.config/ocpp-emulator/config.toml`,
//! overridable via `OCPP_EMULATOR_CONFIG`), registers every configured
//! station, auto-starts the ones flagged `auto_start`, and runs until a
//! shutdown signal arrives.

use std::sync::Arc;

use tracing::{error, info};

use ocpp_emulator::config::{default_config_path, EmulatorConfig};
use ocpp_emulator::infrastructure::{InMemoryMessageRepository, InMemoryStationConfigRepository};
use ocpp_emulator::runtime::create_event_bus;
use ocpp_emulator::runtime::{MessageLogger, StationManager};
use ocpp_emulator::support::{listen_for_shutdown_signals, ShutdownSignal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("OCPP_EMULATOR_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());

    let config = match EmulatorConfig::load(&config_path) {
        Ok(cfg) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level)),
                )
                .init();
            info!(path = %config_path.display(), "configuration loaded");
            cfg
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            error!(error = %e, "failed to load config, using defaults");
            EmulatorConfig::default()
        }
    };

    info!("starting OCPP station emulator");

    let message_sink = Arc::new(InMemoryMessageRepository::default());
    let logger = Arc::new(MessageLogger::new(Some(message_sink)));
    let events = create_event_bus();

    let shutdown = ShutdownSignal::new();
    tokio::spawn(listen_for_shutdown_signals(shutdown.clone()));

    let flush_logger = logger.clone();
    let flush_shutdown = shutdown.clone();
    tokio::spawn(async move { flush_logger.run_flush_loop(flush_shutdown).await });

    let repository = Arc::new(InMemoryStationConfigRepository::new());
    let manager = Arc::new(StationManager::new(
        logger,
        events,
        config.reconnect.clone(),
        repository,
        config.global.clone(),
    ));
    for station in config.stations {
        let id = station.id.clone();
        if manager.register(station) {
            info!(station_id = %id, "station registered");
        } else {
            error!(station_id = %id, "duplicate station id in configuration, skipped");
        }
    }

    manager.reconcile_all().await;

    let sync_manager = manager.clone();
    let sync_shutdown = shutdown.clone();
    tokio::spawn(async move { sync_manager.run_sync_loop(sync_shutdown).await });

    manager.auto_start_all();

    info!("emulator running, press Ctrl+C to shut down");
    shutdown.wait().await;
    info!("shutdown signal received, draining in-flight work");
    for station_id in manager.list_ids() {
        manager.stop(&station_id);
    }
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    info!("shutdown complete");

    Ok(())
}
