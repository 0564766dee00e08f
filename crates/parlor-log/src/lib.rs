//! Structured logging for parlor binaries.
//!
//! Span-based, filterable logging via the `tracing` ecosystem: console
//! output with uptime timestamps and module paths, plus optional JSON file
//! logging for post-mortem analysis. `RUST_LOG` always wins; a CLI/config
//! override comes next; the default is `info`.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the tracing subscriber.
///
/// * `log_dir` — if set, also writes JSON log lines to `parlor.log` there.
/// * `level_override` — filter string applied when `RUST_LOG` is unset
///   (e.g. `"debug"` or `"info,parlor_net=trace"`).
///
/// Call once per process, before the first log line.
pub fn init_logging(log_dir: Option<&Path>, level_override: Option<&str>) {
    let fallback = match level_override {
        Some(level) if !level.is_empty() => level.to_string(),
        _ => "info".to_string(),
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(log_dir) = log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            if let Ok(log_file) = std::fs::File::create(log_dir.join("parlor.log")) {
                let file_layer = fmt::layer()
                    .with_writer(log_file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_timer(fmt::time::uptime())
                    .json();
                subscriber.with(file_layer).init();
                return;
            }
        }
    }

    subscriber.init();
}

/// The default filter used when neither `RUST_LOG` nor an override is set.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info")
}
