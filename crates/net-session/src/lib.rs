//! ultra-net sessions.
//!
//! [`Client`] holds one link to a server; [`Server`] accepts many clients and
//! tracks them in a [`ClientRegistry`]. Each instance owns one background
//! pump thread that:
//! - Polls the transport for inbound messages and hands them to the
//!   data-received callback
//! - Drains transport status changes and drives the connection state machine
//! - Tears the session down exactly once when it stops
//!
//! Application threads only send, replace callbacks, read snapshots, and
//! queue server commands. Every state and registry mutation happens on the
//! pump thread.

pub mod callbacks;
pub mod client;
pub mod config;
pub mod error;
mod pump;
pub mod registry;
pub mod server;
pub mod state;

pub use client::Client;
pub use config::{ServerConfig, SessionConfig};
pub use error::SessionError;
pub use registry::{ClientInfo, ClientRegistry};
pub use server::Server;
pub use state::{AtomicConnectionStatus, ClientAction, ConnectionTracker};

pub use net_protocol::{ClientId, ConnectionHandle, ConnectionStatus, SendMode};
