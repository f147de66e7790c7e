//! Error handling for the relay server

use std::fmt;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay server error types
#[derive(Debug, Clone)]
pub enum RelayError {
    /// Malformed frame, invalid length, wrong stream directionality,
    /// UTF-8 decode failure
    Protocol(String),
    /// Authorization callout rejected the client or did not answer in time
    Auth(String),
    /// Peer or transport closed the connection or a stream
    Connection(String),
    /// A peer's outbound queue is full; the frame was dropped for that peer
    Backpressure(String),
    /// Shutdown was requested while an operation was pending
    Cancelled,
    /// Configuration error
    Config(String),
    /// Server internal error
    Internal(String),
}

impl RelayError {
    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        RelayError::Protocol(msg.into())
    }

    /// Create an authorization error
    pub fn auth<T: Into<String>>(msg: T) -> Self {
        RelayError::Auth(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        RelayError::Connection(msg.into())
    }

    /// Create a backpressure error
    pub fn backpressure<T: Into<String>>(msg: T) -> Self {
        RelayError::Backpressure(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        RelayError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        RelayError::Internal(msg.into())
    }

    /// Whether this error is an ordinary disconnect or shutdown rather than
    /// a fault. Benign errors are never logged above warn.
    pub fn is_benign(&self) -> bool {
        matches!(self, RelayError::Connection(_) | RelayError::Cancelled)
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            RelayError::Auth(msg) => write!(f, "Authorization error: {}", msg),
            RelayError::Connection(msg) => write!(f, "Connection error: {}", msg),
            RelayError::Backpressure(msg) => write!(f, "Backpressure: {}", msg),
            RelayError::Cancelled => write!(f, "Cancelled"),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Connection(format!("IO error: {}", err))
    }
}

impl From<quinn::ConnectError> for RelayError {
    fn from(err: quinn::ConnectError) -> Self {
        RelayError::Connection(format!("QUIC connect error: {}", err))
    }
}

impl From<quinn::ConnectionError> for RelayError {
    fn from(err: quinn::ConnectionError) -> Self {
        RelayError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ReadError> for RelayError {
    fn from(err: quinn::ReadError) -> Self {
        RelayError::Connection(format!("QUIC read error: {}", err))
    }
}

impl From<quinn::ReadExactError> for RelayError {
    fn from(err: quinn::ReadExactError) -> Self {
        RelayError::Connection(format!("QUIC read error: {}", err))
    }
}

impl From<quinn::WriteError> for RelayError {
    fn from(err: quinn::WriteError) -> Self {
        RelayError::Connection(format!("QUIC write error: {}", err))
    }
}

impl From<quinn::ClosedStream> for RelayError {
    fn from(err: quinn::ClosedStream) -> Self {
        RelayError::Connection(format!("Stream closed: {}", err))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Config(format!("JSON error: {}", err))
    }
}
