//! Coordinator binary entry point
//!
//! Usage: `coordinator [bind_addr] [world_size]`
//!
//! `world_size` falls back to `WORLD_SIZE`. Timeouts come from the JSON file
//! named by `RUNTIME_CONFIG`, or the defaults.

use std::net::SocketAddr;

use runtime_core::{init_logging, Error, RuntimeConfig};

use coordinator::{CoordinatorServer, CoordinatorService, ServerConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    init_logging("coordinator=info,runtime_core=info");

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Coordinator exited with error");
        let code = e.downcast_ref::<Error>().map_or(1, Error::exit_code);
        std::process::exit(code);
    }
}

async fn run() -> Result<(), BoxError> {
    let mut args = std::env::args().skip(1);

    let addr: SocketAddr = match args.next() {
        Some(raw) => raw.parse()?,
        None => ServerConfig::default().addr,
    };

    let world_size: usize = match args.next().or_else(|| std::env::var("WORLD_SIZE").ok()) {
        Some(raw) => raw.trim().parse()?,
        None => {
            return Err(Box::new(Error::InvalidConfig {
                message: "world size missing: pass it as the second argument or set WORLD_SIZE"
                    .to_string(),
            }))
        }
    };

    let config = match std::env::var("RUNTIME_CONFIG") {
        Ok(path) => RuntimeConfig::from_json_file(path)?,
        Err(_) => RuntimeConfig::default(),
    };

    tracing::info!(address = %addr, world_size = world_size, "Starting coordinator");

    let service = CoordinatorService::new(world_size, &config.coordinator)?;
    let server = CoordinatorServer::with_config(
        service,
        ServerConfig {
            addr,
            ..Default::default()
        },
    );
    server.run().await
}
