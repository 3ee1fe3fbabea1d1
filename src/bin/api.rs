use ledgerflow::{agent::Assistant, api::start_server, config::AppConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    info!("ledgerflow - API Server");
    info!("Port: {}", config.server.port);

    let (assistant, tokens, _audit) = Assistant::from_config(&config).await?;
    info!(
        has_access = tokens.has_access().await,
        can_refresh = tokens.can_refresh().await,
        "Assistant initialized"
    );

    start_server(Arc::new(assistant), Some(tokens), config.server.port).await?;

    Ok(())
}
