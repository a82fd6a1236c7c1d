use branchdump_core::RestoreError;
use thiserror::Error;

/// Errors raised while speaking the MySQL wire protocol.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol Error: {0}")]
    Protocol(String),
    #[error("Authentication Failed: {0}")]
    Auth(String),
    #[error("Server Error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },
    #[error("Connection closed by peer")]
    Closed,
}

impl WireError {
    /// Whether the connection can still be used after this error.
    ///
    /// A server ERR reply to a query leaves the session intact; anything else
    /// means the byte stream is gone or out of sync.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WireError::Server { .. })
    }
}

impl From<WireError> for RestoreError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Auth(msg) => RestoreError::Authorization(msg),
            WireError::Server { code: 1045, message, .. } => RestoreError::Authorization(message),
            other => RestoreError::Connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
