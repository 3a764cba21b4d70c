use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes the logging system with console output and, when enabled, daily rolling JSON files.
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lead_pipeline=info,tower_http=info"));

    let console_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);

    let file_layer = if config.json_file {
        if let Err(e) = fs::create_dir_all(&config.dir) {
            eprintln!("Could not create log dir {}: {e}", config.dir.display());
        }
        let file_appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
        // Keep the writer thread alive for the process lifetime so logs are flushed
        std::mem::forget(guard);
        Some(fmt::layer().json().with_writer(non_blocking_writer))
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();
}
