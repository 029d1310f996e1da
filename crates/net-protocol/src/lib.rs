//! ultra-net protocol types.
//!
//! Shared vocabulary between the transport adapters and the session layer:
//! connection handles, connection states and status-change notifications,
//! inbound messages, send modes, transport errors, and address helpers.
//! Payloads are opaque byte buffers; this crate never interprets them.

pub mod address;
pub mod error;
pub mod handle;
pub mod message;
pub mod status;

pub use address::{is_valid_ip_address, parse_peer_address, resolve_domain_name};
pub use error::{CloseReason, TransportError};
pub use handle::{ClientId, ConnectionHandle, ListenSocketHandle, PollGroupHandle};
pub use message::{Message, SendMode};
pub use status::{ConnectionInfo, ConnectionState, ConnectionStatus, StatusChange};
