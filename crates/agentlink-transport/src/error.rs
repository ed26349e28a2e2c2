use std::net::SocketAddr;

use agentlink_asyncreq::AsyncReqError;

use crate::channel::ChannelId;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: AsyncReqError,
    },

    /// The listening socket failed and no longer accepts connections.
    #[error("failed to accept connection: {0}")]
    Accept(AsyncReqError),

    /// An I/O error occurred while setting up a socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel does not exist or no longer accepts messages.
    #[error("channel {0} is closed")]
    Closed(ChannelId),
}

pub type Result<T> = std::result::Result<T, TransportError>;
