//! Scenic MCP agent
//!
//! Serves the Scenic automation tools over MCP on stdio. Logs go to stderr and
//! to a daily-rotated file.

use anyhow::Result;
use clap::Parser;
use rmcp::{transport::stdio, ServiceExt};
use scenic_mcp_agent::cli::Cli;
use scenic_mcp_agent::logging::init_logging;
use scenic_mcp_agent::server::ScenicMcpServer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli.log_level, cli.log_dir.as_deref())?;

    let bridge = cli.bridge_config();
    info!(
        endpoint = %bridge.endpoint,
        correlation = ?bridge.correlation,
        max_attempts = bridge.max_attempts,
        "Starting scenic-mcp-agent {}",
        env!("CARGO_PKG_VERSION")
    );

    let server = ScenicMcpServer::new(bridge, cli.supervisor_config());
    let service = server.clone().serve(stdio()).await?;
    info!("Server started, waiting for requests");

    tokio::select! {
        quit = service.waiting() => {
            let reason = quit?;
            info!("MCP session ended: {:?}", reason);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    server.shutdown().await;
    Ok(())
}
