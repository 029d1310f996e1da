//! The transport adapter contract consumed by the session layer.

use std::net::SocketAddr;

use net_protocol::{
    ConnectionHandle, ConnectionInfo, ListenSocketHandle, Message, PollGroupHandle, SendMode,
    StatusChange, TransportError,
};

/// Trait implemented by every transport adapter.
///
/// All methods take `&self`: the session's pump thread drives polls and status
/// changes while application threads call [`Transport::send`] concurrently.
/// Implementations synchronize internally and must never hold an internal lock
/// while invoking the `run_callbacks` handler, because the handler calls back
/// into the adapter (accept, close, poll-group assignment).
pub trait Transport: Send + Sync + 'static {
    /// Bring the adapter up. Called once at the start of every pump run.
    fn init(&self) -> Result<(), TransportError>;

    /// Release everything the adapter holds. Called once at the end of a pump
    /// run that successfully called [`Transport::init`].
    fn shutdown(&self);

    /// Start connecting to a remote listener. Progress is reported through
    /// status changes.
    fn connect(&self, address: SocketAddr) -> Result<ConnectionHandle, TransportError>;

    /// Listen for incoming links. Each new link is reported as a
    /// `Connecting` status change carrying the listen socket.
    fn listen(&self, port: u16) -> Result<ListenSocketHandle, TransportError>;

    /// The bound address of a listen socket (resolves port 0).
    fn listen_address(&self, socket: ListenSocketHandle) -> Option<SocketAddr>;

    fn close_listen_socket(&self, socket: ListenSocketHandle) -> bool;

    fn create_poll_group(&self) -> Result<PollGroupHandle, TransportError>;

    fn destroy_poll_group(&self, group: PollGroupHandle) -> bool;

    /// Accept a pending incoming link.
    fn accept_connection(&self, connection: ConnectionHandle) -> Result<(), TransportError>;

    fn set_connection_poll_group(
        &self,
        connection: ConnectionHandle,
        group: PollGroupHandle,
    ) -> Result<(), TransportError>;

    fn connection_info(&self, connection: ConnectionHandle) -> Option<ConnectionInfo>;

    fn set_connection_name(&self, connection: ConnectionHandle, name: &str) -> bool;

    fn send(
        &self,
        connection: ConnectionHandle,
        payload: &[u8],
        mode: SendMode,
    ) -> Result<(), TransportError>;

    /// Take up to `max` pending messages from one link. An `Err` means the
    /// adapter can no longer receive at all.
    fn receive_on_connection(
        &self,
        connection: ConnectionHandle,
        max: usize,
    ) -> Result<Vec<Message>, TransportError>;

    /// Take up to `max` pending messages from any link in the group, in arrival order.
    fn receive_on_poll_group(
        &self,
        group: PollGroupHandle,
        max: usize,
    ) -> Result<Vec<Message>, TransportError>;

    /// Deliver every queued status change to `handler`, synchronously, on the
    /// calling thread. Changes queued while the handler runs are delivered on
    /// the next call.
    fn run_callbacks(&self, handler: &mut dyn FnMut(&StatusChange));

    /// Close a link. The closing side receives no status change; the peer sees
    /// `ClosedByPeer` with `reason` and `debug`. Returns false for unknown handles.
    fn close_connection(
        &self,
        connection: ConnectionHandle,
        reason: u32,
        debug: Option<&str>,
        linger: bool,
    ) -> bool;
}
