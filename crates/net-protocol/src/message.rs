//! Inbound messages and outbound delivery modes.

use bytes::Bytes;

use crate::handle::ConnectionHandle;

/// Delivery guarantee for one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SendMode {
    /// Ordered and retransmitted until acknowledged.
    #[default]
    Reliable,
    /// Best effort, may be dropped or arrive out of order.
    Unreliable,
}

impl SendMode {
    pub fn from_reliable(reliable: bool) -> Self {
        if reliable { Self::Reliable } else { Self::Unreliable }
    }

    pub fn is_reliable(self) -> bool {
        self == Self::Reliable
    }
}

/// One message received from a peer.
///
/// Dropping the message releases it back to the adapter. The session layer
/// lends the payload to handlers as `&[u8]` and drops the message as soon as
/// the handler returns, so handlers that keep data must copy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    connection: ConnectionHandle,
    payload: Bytes,
}

impl Message {
    pub fn new(connection: ConnectionHandle, payload: impl Into<Bytes>) -> Self {
        Self {
            connection,
            payload: payload.into(),
        }
    }

    /// The link this message arrived on.
    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
