//! Tracing setup for the binary.
//!
//! `RUST_LOG` wins when set; otherwise `devdock=info` (`debug` with `-v`).
//! Events go to stderr as text or JSON, and optionally to a daily-rolling
//! file under `<data_dir>/logs`.

use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_FILE_PREFIX: &str = "devdock.log";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
    /// Directory for the rolling file log; `None` disables it.
    pub file_dir: Option<PathBuf>,
}

impl LogOptions {
    pub fn default_directive(&self) -> &'static str {
        if self.verbose { "devdock=debug" } else { "devdock=info" }
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process so buffered file output is flushed.
pub fn init_tracing(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_directive()));

    let text = (!options.json).then(|| fmt::layer().with_writer(std::io::stderr));
    let json = options
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));

    let (file, guard) = match &options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(file)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(guard)
}
