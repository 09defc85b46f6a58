use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use sync_manager::config::{default_config_path, ensure_default_config};
use sync_manager::mqtt::rumqttc_transport::RumqttcTransport;
use sync_manager::service::control::spawn_control_worker;
use sync_manager::service::SyncService;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    info!("Using configuration {}", config_path.display());
    let config = Arc::new(ensure_default_config(&config_path).await?);

    let transport = Arc::new(RumqttcTransport::new(config.mqtt.publish_timeout()));
    let service = SyncService::new(Arc::clone(&config), transport);
    let (control, worker) = spawn_control_worker(Box::new(service));

    control
        .start()
        .await
        .map_err(|e| eyre!("Failed to start {}: {}", config.service.name, e))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutdown requested");

    if let Err(e) = control.stop().await {
        warn!("Service did not stop cleanly: {}", e);
    }
    drop(control);
    worker
        .await
        .map_err(|e| eyre!("Control worker failed: {}", e))?;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
