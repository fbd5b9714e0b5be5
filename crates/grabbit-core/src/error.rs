//! Error types for Grabbit core

use thiserror::Error;

/// Errors that can occur in Grabbit core
#[derive(Debug, Error)]
pub enum GrabbitError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server responded with {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Transfer interrupted: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Name already in use: {0}")]
    NameConflict(String),

    #[error("Task is still in flight: {0}")]
    TaskActive(String),

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Worker pool has shut down, cannot run {0}")]
    PoolClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GrabbitError {
    /// Failures that come from the remote side rather than from the caller
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            GrabbitError::Network(_) | GrabbitError::HttpStatus { .. } | GrabbitError::Stream(_)
        )
    }
}
