//! Error types for Saga.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SagaError {
    #[error("tmux error: {0}")]
    Tmux(String),

    #[error("Invalid session name: {0}")]
    InvalidSessionName(String),

    #[error("Output file not found: {0}")]
    OutputNotFound(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
