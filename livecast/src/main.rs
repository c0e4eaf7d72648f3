mod server;
mod tls;

use anyhow::Result;
use tracing::info;

use livecast_core::{bootstrap::load_config, logging};

use server::LivecastServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Livecast server starting...");
    info!("Listen address: {}", config.listen_address());

    // 3. Start media workers and the room registry
    let server = LivecastServer::start(config).await?;

    // 4. Serve until shutdown or worker death
    server.run().await
}
