//! Error taxonomy for the watcher.
//!
//! Callers along the hot path need to tell "this container doesn't exist"
//! apart from "the runtime RPC failed" so they can log and continue rather
//! than treat both the same way.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container '{0}' not found")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at '{0}'")]
    NotFound(String),

    #[error("failed to parse config file '{0}': {1}")]
    Malformed(String, String),

    #[error("missing required environment variable(s): {0}")]
    MissingSecrets(String),
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
