use thiserror::Error;

use crate::media::MediaError;

/// Ошибки ядра согласования
#[derive(Debug, Error)]
pub enum Error {
    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaError),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Продолжение относится к уже заменённому соединению
    #[error("epoch {stale} superseded by {current}")]
    Superseded { stale: u64, current: u64 },

    #[error("connection slot already holds a handle for epoch {0}")]
    SlotOccupied(u64),

    #[error("signaling channel closed")]
    SignalingClosed,

    #[error("session stopped")]
    SessionClosed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_superseded(&self) -> bool {
        matches!(self, Error::Superseded { .. })
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::SessionClosed
    }
}

pub type Result<T> = std::result::Result<T, Error>;
