//! Configuration system for parlor binaries.
//!
//! Runtime-configurable settings persisted as RON, with CLI overrides via
//! clap, change detection on reload, and forward/backward compatible
//! serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, EngineTuning, NetworkConfig};
pub use error::ConfigError;
