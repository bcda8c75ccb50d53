use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_agent_server::{listen, ProcessManager, ServerConfig};

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_tracing(config.verbose);

    let supervisor = config.supervisor_config();
    supervisor.validate()?;
    let manager = Arc::new(ProcessManager::new(supervisor, config.default_properties()));

    let (addr, serve) = listen(config.socket_addr(), manager).await?;
    info!(%addr, "Node agent ready");
    serve.await;
    Ok(())
}
