use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use wirehub::{BroadcastApp, Config, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        ip = %config.ip,
        port = config.port,
        io_type = ?config.io_type,
        worker_threads = config.worker_threads,
        "starting wirehub"
    );

    let server = Server::bind(config, Arc::new(BroadcastApp))?;
    server.run()?;
    Ok(())
}
