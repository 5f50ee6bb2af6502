use anyhow::Result;
use calendar_worker::{Pipeline, PipelineConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "calendar_worker=info,calendar_broker=info,calendar_store=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }

    tracing::info!("calendar-worker starting...");

    let config = PipelineConfig::from_env()?;
    tracing::info!(
        role = ?config.role,
        storage = ?config.storage_backend,
        broker = ?config.broker_backend,
        topic = %config.scheduler.topic,
        "Worker configured"
    );

    let pipeline = Pipeline::build(config).await?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    pipeline.run(token).await?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
