use thiserror::Error;

pub type Result<T> = std::result::Result<T, KadError>;

#[derive(Debug, Error)]
pub enum KadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("request too large: {0} bytes")]
    RequestTooLarge(usize),

    #[error("rpc timeout")]
    Timeout,

    #[error("server is not listening")]
    NotListening,

    #[error("server is already listening")]
    AlreadyListening,
}
