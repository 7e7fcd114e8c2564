//! Real-time event relay server.
//!
//! Fans backend-published events out to connected WebSocket clients over
//! three namespaces, scaling across instances through a Redis backbone.
//!
//! Run with:
//! ```not_rust
//! RELAY_JWT_SECRET=... cargo run --bin relaycast-server
//! RELAY_JWT_SECRET=... cargo run --bin relaycast-server -- --port 3000
//! ```

use std::sync::Arc;

use clap::Parser;
use relaycast::backbone::RedisBackbone;
use relaycast::logger::setup_logger;
use relaycast::{Config, RelayServer};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "relaycast-server")]
#[command(about = "Real-time event relay over WebSocket + Redis pub/sub", long_about = None)]
struct Args {
    /// Host address to bind to (overrides RELAY_HOST)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to bind to (overrides RELAY_PORT)
    #[arg(short = 'p', long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let backbone_shutdown = CancellationToken::new();
    let backbone = match RedisBackbone::new(&config.backbone_url, backbone_shutdown.clone()) {
        Ok(backbone) => Arc::new(backbone),
        Err(e) => {
            tracing::error!("Invalid backbone URL '{}': {}", config.backbone_url, e);
            std::process::exit(1);
        }
    };

    let server = RelayServer::new(config, backbone);
    let result = server.run().await;

    // The listener is closed by now; drop the backbone subscriptions too.
    backbone_shutdown.cancel();

    if let Err(e) = result {
        tracing::error!("Relay error: {}", e);
        std::process::exit(1);
    }
}
