use courier_common::config::AppConfig;
use courier_notifier::services::Services;
use courier_notifier::worker::{WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier notifier starting...");

    let config = AppConfig::from_env()?;
    config.validate()?;

    let services = Services::connect(&config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool = WorkerPool::new(services.dispatcher.clone(), WorkerConfig::from_config(&config));
    let handles = pool.spawn(shutdown_rx);

    tracing::info!(workers = handles.len(), "Worker pools running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, draining workers...");

    shutdown_tx.send(true)?;
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker exited abnormally");
        }
    }

    tracing::info!("Courier notifier stopped.");
    Ok(())
}
