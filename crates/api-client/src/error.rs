use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Connection is stale: {0}")]
    Stale(String),
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(#[from] serde_json::Error),
    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(String),
    #[error("The link has been closed")]
    LinkClosed,
}

impl Error {
    /// Transient errors are retried with backoff; the rest need a manual reset
    /// or mean the link is gone for good.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::ConnectTimeout(_) | Self::Stale(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
