//! Bifrost demo node.
//!
//! Configuration comes from `BIFROST_*` environment variables; see
//! [`bifrost_node::config::NodeConfig::from_env`].

use anyhow::Result;
use bifrost_node::config::NodeConfig;
use bifrost_node::{telemetry, Node};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env();
    telemetry::init_logging(&config)?;

    let node = Node::new(config)?;
    node.start().await?;

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    node.shutdown().await;
    Ok(())
}
