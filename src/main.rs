use rapport::clock::SystemClock;
use rapport::config::{Config, ConfigProvider, Tunables};
use rapport::db::Database;
use rapport::delivery::LogDelivery;
use rapport::dispatcher::{Dispatcher, DispatcherSettings};
use rapport::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let db = Database::new(&config)?;
    db.execute_init()?;

    let provider = Arc::new(ConfigProvider::new(
        Tunables::default(),
        config.tunables_file.as_ref().map(PathBuf::from),
    ));
    provider.reload(&db).await?;

    let engine = Arc::new(
        Engine::new(db, provider, Arc::new(SystemClock))
            .with_expiry_warning(chrono::Duration::days(config.expiry_warning_days)),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        engine,
        Arc::new(LogDelivery),
        DispatcherSettings::from_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = dispatcher.spawn(shutdown_rx);
    info!("Engine started; background loops running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background loop ended abnormally: {}", e);
        }
    }

    Ok(())
}
