use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid parent: {0}")]
    InvalidParent(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("resync timed out after {0} ms")]
    ResyncTimeout(u64),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}
