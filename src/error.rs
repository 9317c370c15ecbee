use std::io;

/// Errors surfaced by the recording pipeline.
///
/// Transient I/O faults inside running services are logged and absorbed;
/// what reaches callers is either a timeout or a configuration problem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation timed out")]
    Timeout,

    #[error("invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u8),

    #[error("invalid target pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("service '{0}' already started")]
    AlreadyStarted(String),

    #[error("metrics exporter: {0}")]
    Metrics(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
