// log-relay: Accepts framed log events on a unix-domain socket, buffers
// them durably, and forwards them to the central log database.
//
// Exit is always non-zero: the relay runs until something goes wrong and
// relies on external supervision (systemd) to restart it; recovery is
// the boot-time queue scan.

use std::path::Path;

use tracing::{error, info};

use log_relay::config::{self, RelayConfig};
use log_relay::forwarder::Forwarder;
use log_relay::server::FrameServer;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "log relay starting");

    let cfg = match config::load_config() {
        Ok(cfg) => {
            info!(
                socket = %cfg.socket.path,
                queue = %cfg.queue.sqlite_path,
                workers = cfg.sender.num_workers,
                database = %cfg.database.url,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg).await {
        error!(error = %e, "log relay terminated");
        std::process::exit(1);
    }
}

async fn run(cfg: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let forwarder = Forwarder::new(&cfg)?;
    forwarder.seed_pending_from_queue().await?;

    let server = FrameServer::bind(Path::new(&cfg.socket.path))?;
    tokio::spawn(server.run(forwarder.ingest_handle()));

    forwarder.run().await?;
    Ok(())
}
