use anyhow::Result;
use quotaguard::config::Config;
use quotaguard::server::{build_engine, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("quotaguard={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting quotaguard service");
    tracing::info!(
        bind_addr = %config.bind_addr,
        store_mode = ?config.effective_store_mode(),
        redis_configured = config.redis_url.is_some(),
        "Configuration loaded"
    );

    let engine = build_engine(&config)
        .map_err(|e| anyhow::anyhow!("Failed to build quota engine: {}", e))?;

    Server::bind(engine, config.bind_addr)
        .await?
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
