//! Command-line argument parsing for parlor binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Common command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "parlor", about = "Deterministic shared-room state engine")]
pub struct CliArgs {
    /// Broker address.
    #[arg(long)]
    pub broker: Option<String>,

    /// Broker port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Ticks per second.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Clock tolerance in milliseconds.
    #[arg(long)]
    pub tolerance_ms: Option<i64>,

    /// Disable the snapshot cache (full replay on every query).
    #[arg(long)]
    pub no_cache: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.broker {
            self.network.broker_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.broker_port = port;
        }
        if let Some(rate) = args.tick_rate {
            self.engine.tick_rate = rate;
        }
        if let Some(tolerance) = args.tolerance_ms {
            self.engine.tolerance_ms = tolerance;
        }
        if args.no_cache {
            self.engine.cache_enabled = false;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
