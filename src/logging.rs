use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use snafu::prelude::*;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{OpenLogFileSnafu, Result};

/// Log file written to the working directory with `--logging`.
pub const LOG_FILE_NAME: &str = "dicom-upload.log";

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the verbose flag for the console. An optional log file
/// records this crate at debug level regardless.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(OpenLogFileSnafu { path })?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new("info,dicom_upload=debug")),
            )
        }
        None => None,
    };

    // Only set global logger if not already set (it can only be set once per process)
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init();
    Ok(())
}
