use thiserror::Error;

pub type Result<T> = std::result::Result<T, BasaltError>;

#[derive(Error, Debug)]
pub enum BasaltError {
    #[error("insufficient space: requested {requested} blocks, {available} available")]
    InsufficientSpace { requested: u64, available: u64 },

    #[error("block {0} is not reserved")]
    NotReserved(u64),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("truncated transfer: expected {expected} bytes, received {received}")]
    TruncatedTransfer { expected: u64, received: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
