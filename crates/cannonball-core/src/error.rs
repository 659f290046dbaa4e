//! Error surface of the tracing core.
//!
//! Install-time errors abort plugin installation and are reported
//! through the host's install-failure channel.  Hot-path failures never
//! surface here: they are logged, the offending event is dropped, and
//! tracing continues.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Tracer failure")]
    Failure,

    #[error("Scratch table at capacity")]
    OutOfMemory,

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Help requested, aborting install")]
    HelpRequested,

    #[error("Failed to set up event sender: {0}")]
    SenderInit(#[source] std::io::Error),

    #[error("Invalid log file path: {0}")]
    InvalidLogFilePath(String),

    #[error("Log file directory does not exist: {0}")]
    MissingLogDirectory(String),

    #[error("Failed to open log file: {0}")]
    LogFileOpenFailed(#[source] std::io::Error),

    #[error("System emulation is not supported")]
    SystemEmulationUnsupported,
}
