//! Error types for Callflow Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Permission denied or no capture device for the requested call type
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Malformed SDP or a description applied out of order
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The peer connection failed, closed unexpectedly or could not be built
    #[error("Peer connection failure: {0}")]
    PeerConnection(String),

    /// The call-log collaborator answered with a non-success status
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Invalid call state: {0}")]
    InvalidState(String),

    #[error("Call engine stopped")]
    EngineStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::PeerConnection(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(e.to_string())
    }
}
