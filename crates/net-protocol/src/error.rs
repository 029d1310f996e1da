//! Transport error types and connection close reasons.

use thiserror::Error;

use crate::handle::{ConnectionHandle, ListenSocketHandle, PollGroupHandle};
use crate::status::ConnectionState;

/// Reason codes attached to a locally closed connection and reported to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unspecified,
    /// Generic application-initiated close.
    Application,
    /// The server removed this client.
    Kicked,
    /// The server is shutting down.
    ServerShutdown,
    /// The link failed on our side (timeout, reset, protocol violation).
    LocalProblem,
    /// The peer reported a failure.
    RemoteProblem,
    Custom(u32),
}

impl CloseReason {
    pub fn code(&self) -> u32 {
        match self {
            Self::Unspecified => 0,
            Self::Application => 1000,
            Self::Kicked => 1001,
            Self::ServerShutdown => 1002,
            Self::LocalProblem => 3001,
            Self::RemoteProblem => 4001,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Unspecified,
            1000 => Self::Application,
            1001 => Self::Kicked,
            1002 => Self::ServerShutdown,
            3001 => Self::LocalProblem,
            4001 => Self::RemoteProblem,
            c => Self::Custom(c),
        }
    }
}

/// Errors returned by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not initialized")]
    NotInitialized,

    #[error("could not initialize transport: {0}")]
    InitFailed(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown connection {0}")]
    InvalidConnection(ConnectionHandle),

    #[error("unknown listen socket {0}")]
    InvalidListenSocket(ListenSocketHandle),

    #[error("unknown poll group {0}")]
    InvalidPollGroup(PollGroupHandle),

    #[error("connection {connection} is in state {state:?}")]
    InvalidState {
        connection: ConnectionHandle,
        state: ConnectionState,
    },

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("failed to listen on port {port}: {reason}")]
    ListenFailed { port: u16, reason: String },

    #[error("failed to create poll group: {0}")]
    PollGroupFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
