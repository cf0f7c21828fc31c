use thiserror::Error;

/// Errors produced by the agentmux protocol layer.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("setup rejected by peer")]
    SetupRejected,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("connection {0} closed")]
    ConnectionClosed(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for MuxError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        MuxError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for MuxError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        MuxError::Codec(e.to_string())
    }
}

pub type MuxResult<T> = Result<T, MuxError>;
