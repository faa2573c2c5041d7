//! Gateway-level error types.

use buslink_types::BridgeError;
use std::path::PathBuf;
use thiserror::Error;

/// Gateway error type wrapping BridgeError with loading and startup context.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A wrapped BridgeError.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The configuration file could not be read.
    #[error("Failed to read config '{path}': {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file (or one of its includes) is not valid TOML
    /// for a gateway.
    #[error("Invalid config '{path}': {message}")]
    ParseConfig { path: PathBuf, message: String },

    /// The gateway could not be started.
    #[error("Start failed: {0}")]
    StartFailed(String),
}

/// Alias for gateway results.
pub type GatewayResult<T> = Result<T, GatewayError>;
