//! Logging initialization.
//!
//! The plugin runs inside the host emulator's process, so it cannot
//! rely on the environment-driven `env_logger::init()` a standalone
//! binary would use: the destination and level come from the plugin's
//! own options.  `-` logs to stderr; any other path must point at a
//! writable file in an existing directory.

use std::fs::File;
use std::path::Path;

use log::LevelFilter;

use crate::error::CoreError;

/// Map a numeric option level onto a [`LevelFilter`].
fn level_filter(log_level: i64) -> Result<LevelFilter, CoreError> {
    match log_level {
        0 => Ok(LevelFilter::Off),
        1 => Ok(LevelFilter::Error),
        2 => Ok(LevelFilter::Warn),
        3 => Ok(LevelFilter::Info),
        4 => Ok(LevelFilter::Debug),
        _ => Err(CoreError::Argument(format!(
            "Invalid log level: {} (expected 0-4)",
            log_level
        ))),
    }
}

/// Validate the log destination and install the global logger.
///
/// A logger that is already installed (a second plugin instance in the
/// same process, or a test harness) is not an error; the existing
/// logger wins.
pub fn init(log_file: &str, log_level: i64) -> Result<(), CoreError> {
    let filter = level_filter(log_level)?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter);

    if log_file == "-" {
        builder.target(env_logger::Target::Stderr);
    } else {
        let path = Path::new(log_file);

        if log_file.is_empty() || path.is_dir() {
            return Err(CoreError::InvalidLogFilePath(log_file.to_string()));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(CoreError::MissingLogDirectory(
                    parent.display().to_string(),
                ));
            }
        }

        let file = File::create(path).map_err(CoreError::LogFileOpenFailed)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    let _ = builder.try_init();
    Ok(())
}
