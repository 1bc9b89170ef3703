use thiserror::Error;

use crate::channel::Direction;
use crate::status::Status;

// Local and transport failures
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel closed: {0} direction")]
    ChannelClosed(Direction),
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::UnknownMethod(_) => Status::unknown(err.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}
