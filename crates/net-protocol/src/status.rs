//! Connection lifecycle vocabulary.
//!
//! Two layers live here:
//! - [`ConnectionState`] is what the transport adapter reports for a link.
//! - [`ConnectionStatus`] is what the client session exposes to applications,
//!   derived from the adapter's [`StatusChange`] notifications.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::handle::{ConnectionHandle, ListenSocketHandle};

/// Client-visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum ConnectionStatus {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    FailedToConnect = 3,
}

impl ConnectionStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::FailedToConnect,
            _ => Self::Disconnected,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether a connection handle held alongside this status may be used.
    pub fn handle_is_valid(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Adapter-level state of a single link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No link, or the link has been destroyed locally.
    #[default]
    None,
    /// Handshake in progress. On a listen socket this means "pending accept".
    Connecting,
    /// Handshake done, still negotiating a route to the peer.
    FindingRoute,
    Connected,
    /// The peer closed the link.
    ClosedByPeer,
    /// Timeout, reset, or another local failure ended the link.
    ProblemDetectedLocally,
}

impl ConnectionState {
    /// States reached when the link ends for a reason other than a local close.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::ClosedByPeer | Self::ProblemDetectedLocally)
    }

    /// States during which the link has not finished connecting yet.
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Connecting | Self::FindingRoute)
    }

    pub fn is_live(self) -> bool {
        self.is_handshaking() || self == Self::Connected
    }
}

/// Snapshot of a link as the adapter sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    /// Set for links that arrived on one of our listen sockets.
    pub listen_socket: Option<ListenSocketHandle>,
    pub remote_address: Option<SocketAddr>,
    /// Application or adapter reason code, meaningful once the link ended.
    pub end_reason: u32,
    /// Human-readable reason the link ended. Empty while the link is live.
    pub end_debug: String,
    /// Human-readable description, e.g. `#7 127.0.0.1:53012`.
    pub description: String,
}

/// A single state transition reported by the adapter during `run_callbacks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub connection: ConnectionHandle,
    pub old_state: ConnectionState,
    pub info: ConnectionInfo,
}

impl StatusChange {
    pub fn new(connection: ConnectionHandle, old_state: ConnectionState, info: ConnectionInfo) -> Self {
        Self {
            connection,
            old_state,
            info,
        }
    }

    pub fn new_state(&self) -> ConnectionState {
        self.info.state
    }

    /// True when this change arrived for a link created by one of our listen sockets.
    pub fn is_incoming(&self) -> bool {
        self.info.listen_socket.is_some()
    }
}
