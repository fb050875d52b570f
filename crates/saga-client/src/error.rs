//! Error types for the observer client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection manager has shut down")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
