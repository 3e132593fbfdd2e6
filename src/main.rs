//! frame-gate server binary.

use frame_gate::{Config, Server, ServerError};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let workers = config.workers.unwrap_or_else(num_cpus);

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        read_size = config.read_size,
        write_size = config.write_size,
        heartbeat_after_s = config.heartbeat_after.as_secs(),
        idle_timeout_s = config.idle_timeout.as_secs(),
        workers,
        "Starting frame-gate server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("frame-gate-worker")
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))?;
    Ok(())
}

async fn serve(config: Config) -> Result<(), ServerError> {
    let server = Arc::new(Server::bind(config).await?);

    tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    server.shutdown();
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    });

    let result = server.run().await;
    if let Err(ref e) = result {
        error!(error = %e, "Server failed");
    }
    result
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
