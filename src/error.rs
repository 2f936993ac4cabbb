use std::io;
use thiserror::Error;

use crate::manager::InstanceId;

/// Errors raised while decoding a protocol header
///
/// Always recoverable by dropping the single connection that produced it.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Stream ended before the header was complete
    #[error("truncated header")]
    Truncated,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    #[error("unknown address type: {0}")]
    UnknownAddressType(u8),

    #[error("missing CRLF")]
    MissingCrlf,

    #[error("invalid domain encoding")]
    InvalidDomain,

    #[error("malformed header: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(err)
        }
    }
}

/// Errors raised by a storage backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Unified error type for the proxy engine
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Credential mismatch. Carries no detail on purpose.
    #[error("authentication failed")]
    Auth,

    #[error("dial error: {0}")]
    Dial(String),

    #[error("port {0} is already in use by an enabled instance")]
    PortInUse(u16),

    #[error("failed to listen on port {port}: {source}")]
    Listener {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("proxy instance not found: {0}")]
    NotFound(InstanceId),

    #[error("server instance is already running")]
    AlreadyRunning,

    #[error("server instance is not running")]
    NotRunning,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
