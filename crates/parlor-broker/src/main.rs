//! The broker binary: stamp, append, fan out.
//!
//! Run with: `cargo run -p parlor-broker -- --bind 0.0.0.0:9440 --data-dir ./rooms`

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use parlor_broker::{Broker, BrokerConfig};

/// CLI arguments for the broker binary.
#[derive(Parser, Debug)]
#[command(name = "parlor-broker", about = "Append-only room-log broker")]
struct BrokerArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:9440")]
    bind: SocketAddr,

    /// Directory holding the room logs.
    #[arg(long, default_value = "./rooms")]
    data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = BrokerArgs::parse();
    parlor_log::init_logging(None, args.log_level.as_deref());

    let config = BrokerConfig {
        bind_addr: args.bind,
        data_dir: args.data_dir,
        ..BrokerConfig::default()
    };
    info!(
        "rooms under {}, listening on {}",
        config.data_dir.display(),
        config.bind_addr
    );

    let broker = match Broker::new(config) {
        Ok(broker) => broker,
        Err(err) => {
            eprintln!("failed to open room store: {err}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = broker.run() => {
            if let Err(err) = result {
                eprintln!("broker failed: {err}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            broker.shutdown();
        }
    }
}
