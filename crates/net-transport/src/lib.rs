//! ultra-net transport adapters.
//!
//! The session layer never talks to sockets directly. It drives a
//! [`Transport`] implementation, which owns:
//! - Connection establishment (connect, listen, accept)
//! - Message delivery (send, receive polls, poll groups)
//! - Status-change notifications, delivered synchronously from `run_callbacks`
//!
//! Two adapters ship with the crate: [`TcpTransport`] for real networks and
//! [`MemoryTransport`] for deterministic in-process networks.

pub mod frame;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use transport::Transport;
