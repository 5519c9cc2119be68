use thiserror::Error;

/// Collector error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication error
    #[error("authentication error: {0}")]
    Auth(String),

    /// Realtime stream error
    #[error("stream error: {0}")]
    Stream(String),

    /// Lookup abandoned after repeated rate limiting
    #[error("rate limited looking up device {0}")]
    RateLimited(String),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Collector result type
pub type Result<T> = std::result::Result<T, Error>;
