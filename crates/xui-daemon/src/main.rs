//! x-ui Engine Daemon - Main Entry Point

mod config;

use config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xui_engine::{
    run_maintenance, ConfigSynthesizer, FileTemplate, JsonFileStore, StaticTemplate, Supervisor,
    TemplateSource, XrayLauncher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("x-ui engine daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::var("XUI_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config = DaemonConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Config {} not loaded ({}), using defaults", config_path, e);
        DaemonConfig::default()
    });

    let store = Arc::new(JsonFileStore::new(&config.inbound_db));
    let template: Arc<dyn TemplateSource> = match &config.template_path {
        Some(path) => Arc::new(FileTemplate::new(path)),
        None => Arc::new(StaticTemplate::default()),
    };
    let synthesizer = ConfigSynthesizer::new(store, template);
    let launcher = Arc::new(XrayLauncher::new(config.engine.clone()));
    let supervisor = Arc::new(Supervisor::new(synthesizer, launcher));

    // Initial start; the maintenance loop retries if the engine comes up crashed
    if let Err(e) = supervisor.restart_if_needed(true).await {
        tracing::error!("Failed to start xray: {}", e);
    } else {
        tracing::info!("xray {} running", supervisor.version().await);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = tokio::spawn(run_maintenance(
        supervisor.clone(),
        config.intervals(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    let _ = shutdown_tx.send(true);
    maintenance.await?;

    match supervisor.stop().await {
        Ok(()) | Err(xui_engine::EngineError::NotRunning) => {}
        Err(e) => tracing::warn!("Failed to stop xray: {}", e),
    }

    Ok(())
}
