use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Core(#[from] topicsync_core::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("session closed")]
    Closed,
}

impl NetError {
    /// Connect and send failures, in the core taxonomy.
    pub fn into_transport(self) -> topicsync_core::Error {
        match self {
            NetError::Core(err) => err,
            other => topicsync_core::Error::Transport(other.to_string()),
        }
    }
}
