use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for SIP transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for SIP transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to bind to the specified address
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, io::Error),

    /// Failed to send message to the specified address
    #[error("Failed to send message to {0}: {1}")]
    SendFailed(SocketAddr, io::Error),

    /// Failed to receive message
    #[error("Failed to receive message: {0}")]
    ReceiveFailed(io::Error),

    /// Failed to get local address
    #[error("Failed to get local address: {0}")]
    LocalAddrFailed(io::Error),

    /// Transport is closed
    #[error("Transport closed")]
    TransportClosed,

    /// No listener could be bound at startup
    #[error("No listeners could be bound")]
    NoListeners,

    /// Connection closed by peer
    #[error("Connection closed by peer: {0}")]
    ConnectionClosedByPeer(SocketAddr),

    /// TLS general error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// Message too large for transport
    #[error("Message too large for transport ({0} bytes)")]
    MessageTooLarge(usize),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Failed to parse message
    #[error("Failed to parse message: {0}")]
    ParseError(String),

    /// No connection is open toward the destination
    #[error("No open connection to {0}")]
    NoConnection(SocketAddr),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl Error {
    /// Returns true if the error is related to TLS
    pub fn is_tls_error(&self) -> bool {
        matches!(self, Error::TlsError(_) | Error::TlsHandshakeFailed(_))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
