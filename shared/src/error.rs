use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Input held nothing but delimiters or whitespace.
    #[error("incomplete message")]
    Incomplete,

    #[error("invalid message: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid {action} payload: {source}")]
    Payload {
        action: String,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
