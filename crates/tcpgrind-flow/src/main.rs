#![warn(missing_docs)]

//! tcpgrind daemon: hosts the flow admission core

use std::path::PathBuf;

use tcpgrind_flow::{FlowAdmission, FlowEngineConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => FlowEngineConfig::from_file(&path)?,
        None => FlowEngineConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("tcpgrind daemon starting...");
    let admission = FlowAdmission::new(config)?;
    tracing::info!(capacity = admission.registry().capacity(), "flow admission core ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!(flows = admission.registry().len(), "tcpgrind daemon shutting down");
    Ok(())
}
