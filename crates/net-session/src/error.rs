//! Session error types.

use net_protocol::TransportError;
use thiserror::Error;

/// Conditions that stop a session before its pump enters the poll loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to initialize transport: {0}")]
    TransportInit(#[source] TransportError),

    #[error("invalid server address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to connect: {0}")]
    Connect(#[source] TransportError),

    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("failed to create poll group: {0}")]
    PollGroup(#[source] TransportError),

    #[error("failed to spawn pump thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}
