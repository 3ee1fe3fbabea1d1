use ledgerflow::{
    agent::{Assistant, DEFAULT_CHAT_ID},
    config::AppConfig,
    models::ResponseType,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Logs go to stderr so stdout carries only the JSON envelope
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if query.trim().is_empty() {
        eprintln!("usage: ledgerflow \"<request>\"");
        eprintln!("example: ledgerflow \"show the profit and loss report for last month\"");
        std::process::exit(2);
    }

    let config = AppConfig::from_env()?;
    let (assistant, _tokens, audit) = Assistant::from_config(&config).await?;

    info!(query = %query, "Running query");
    let response = assistant.handle(&query, DEFAULT_CHAT_ID).await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    info!(audit_entries = audit.entries().len(), "Done");

    if response.kind == ResponseType::Error {
        std::process::exit(1);
    }
    Ok(())
}
