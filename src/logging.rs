//! Logging setup shared by the binaries

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LoggingConfig) -> Result<(), crate::Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| crate::Error::Config(format!("Invalid log level: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match (&config.file, config.format.as_str()) {
        (Some(path), format) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| crate::Error::Config(format!("Failed to open log file: {}", e)))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            match format {
                "json" => builder.json().try_init(),
                "compact" => builder.compact().try_init(),
                _ => builder.try_init(),
            }
        }
        (None, "json") => builder.json().try_init(),
        (None, "compact") => builder.compact().try_init(),
        (None, _) => builder.pretty().try_init(),
    };

    result.map_err(|e| crate::Error::Config(format!("Failed to initialize logging: {}", e)))
}
