use anyhow::Result;
use opcpub_agent::{Agent, AgentConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting opcpub agent"
    );

    // Load configuration
    let config = AgentConfig::from_env()?;

    tracing::info!(
        publisher_id = %config.publisher_id,
        writers = config.published_nodes.len(),
        "Agent configured"
    );

    let agent = Agent::new(config)?;

    // Run agent
    agent.run().await?;

    Ok(())
}
