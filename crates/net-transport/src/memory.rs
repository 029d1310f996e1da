//! In-process transport adapter.
//!
//! A [`MemoryNetwork`] is a shared switchboard; every [`MemoryTransport`]
//! created from it is one endpoint (one "process") on that network. Links,
//! messages, and status changes behave like the real adapter's, only
//! deterministic and instant: a connect reaches the listener immediately,
//! accept completes both sides at once, and messages are never lost.
//!
//! Faults can be switched on per endpoint with [`Faults`] to exercise the
//! session layer's error paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use net_protocol::{
    CloseReason, ConnectionHandle, ConnectionInfo, ConnectionState, ListenSocketHandle, Message,
    PollGroupHandle, SendMode, StatusChange, TransportError,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::transport::Transport;

const EPHEMERAL_PORT_START: u16 = 40_000;
const ENDPOINT_PORT_BASE: u16 = 50_000;

/// Failure switches for one endpoint. Each stays on until cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    pub fail_init: bool,
    pub fail_listen: bool,
    pub fail_create_poll_group: bool,
    pub fail_accept: bool,
    pub fail_poll_group_assignment: bool,
    pub fail_receive: bool,
}

/// Shared in-process network. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    next_handle: u32,
    next_endpoint: u16,
    next_port: u16,
    endpoints: HashMap<u16, Endpoint>,
    connections: HashMap<ConnectionHandle, MemoryConnection>,
    listeners: HashMap<ListenSocketHandle, MemoryListener>,
    groups: HashMap<PollGroupHandle, u16>,
}

#[derive(Debug, Default)]
struct Endpoint {
    initialized: bool,
    init_count: usize,
    shutdown_count: usize,
    inbound: VecDeque<Message>,
    status_queue: VecDeque<StatusChange>,
    faults: Faults,
}

#[derive(Debug)]
struct MemoryListener {
    endpoint: u16,
    address: SocketAddr,
}

#[derive(Debug)]
struct MemoryConnection {
    endpoint: u16,
    peer: Option<ConnectionHandle>,
    state: ConnectionState,
    listen_socket: Option<ListenSocketHandle>,
    remote_address: Option<SocketAddr>,
    poll_group: Option<PollGroupHandle>,
    description: String,
    end_reason: u32,
    end_debug: String,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint to the network.
    pub fn endpoint(&self) -> MemoryTransport {
        let mut state = self.state.lock();
        state.next_endpoint += 1;
        let id = state.next_endpoint;
        state.endpoints.insert(id, Endpoint::default());
        MemoryTransport {
            network: self.clone(),
            id,
        }
    }
}

impl NetworkState {
    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn endpoint_mut(&mut self, id: u16) -> &mut Endpoint {
        self.endpoints.entry(id).or_default()
    }

    fn info(&self, handle: ConnectionHandle) -> Option<ConnectionInfo> {
        self.connections.get(&handle).map(|conn| ConnectionInfo {
            state: conn.state,
            listen_socket: conn.listen_socket,
            remote_address: conn.remote_address,
            end_reason: conn.end_reason,
            end_debug: conn.end_debug.clone(),
            description: conn.description.clone(),
        })
    }

    /// Move a link to `new_state` and queue the change on its owner's endpoint.
    fn transition(&mut self, handle: ConnectionHandle, new_state: ConnectionState, reason: u32, end_debug: &str) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        let old_state = conn.state;
        conn.state = new_state;
        if new_state.is_closing() {
            conn.end_reason = reason;
            conn.end_debug = end_debug.to_string();
        }
        let endpoint = conn.endpoint;
        if let Some(info) = self.info(handle) {
            self.endpoint_mut(endpoint)
                .status_queue
                .push_back(StatusChange::new(handle, old_state, info));
        }
    }

    /// Tell the peer of `handle` that the link is gone, then unlink them.
    fn notify_peer_closed(&mut self, handle: ConnectionHandle, state: ConnectionState, reason: u32, end_debug: &str) {
        let Some(peer) = self.connections.get_mut(&handle).and_then(|c| c.peer.take()) else {
            return;
        };
        let peer_live = match self.connections.get_mut(&peer) {
            Some(peer_conn) => {
                peer_conn.peer = None;
                peer_conn.state.is_live()
            }
            None => false,
        };
        if peer_live {
            self.transition(peer, state, reason, end_debug);
        }
    }

    fn remove_connection(&mut self, handle: ConnectionHandle, reason: u32, end_debug: &str) -> bool {
        if !self.connections.contains_key(&handle) {
            return false;
        }
        self.notify_peer_closed(handle, ConnectionState::ClosedByPeer, reason, end_debug);
        if let Some(conn) = self.connections.remove(&handle) {
            let endpoint = self.endpoint_mut(conn.endpoint);
            endpoint.inbound.retain(|m| m.connection() != handle);
            endpoint.status_queue.retain(|c| c.connection != handle);
        }
        true
    }

    fn owned(&self, endpoint: u16, handle: ConnectionHandle) -> Result<&MemoryConnection, TransportError> {
        self.connections
            .get(&handle)
            .filter(|c| c.endpoint == endpoint)
            .ok_or(TransportError::InvalidConnection(handle))
    }

    fn take_messages(&mut self, endpoint: u16, max: usize, matches: impl Fn(&Message) -> bool) -> Vec<Message> {
        let inbound = &mut self.endpoint_mut(endpoint).inbound;
        let mut taken = Vec::new();
        let mut idx = 0;
        while idx < inbound.len() && taken.len() < max {
            if matches(&inbound[idx]) {
                if let Some(message) = inbound.remove(idx) {
                    taken.push(message);
                }
            } else {
                idx += 1;
            }
        }
        taken
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    id: u16,
}

impl MemoryTransport {
    /// Convenience: a fresh network with a single endpoint.
    pub fn standalone() -> Self {
        MemoryNetwork::new().endpoint()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// The virtual address peers see for this endpoint.
    pub fn local_address(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), ENDPOINT_PORT_BASE + self.id)
    }

    pub fn set_faults(&self, faults: Faults) {
        self.network.state.lock().endpoint_mut(self.id).faults = faults;
    }

    pub fn faults(&self) -> Faults {
        self.network.state.lock().endpoint_mut(self.id).faults.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.network.state.lock().endpoint_mut(self.id).initialized
    }

    pub fn init_count(&self) -> usize {
        self.network.state.lock().endpoint_mut(self.id).init_count
    }

    pub fn shutdown_count(&self) -> usize {
        self.network.state.lock().endpoint_mut(self.id).shutdown_count
    }

    /// Links currently owned by this endpoint, in handle order.
    pub fn open_connections(&self) -> Vec<ConnectionHandle> {
        let state = self.network.state.lock();
        let mut handles: Vec<_> = state
            .connections
            .iter()
            .filter(|(_, c)| c.endpoint == self.id)
            .map(|(h, _)| *h)
            .collect();
        handles.sort();
        handles
    }

    pub fn connection_poll_group(&self, connection: ConnectionHandle) -> Option<PollGroupHandle> {
        let state = self.network.state.lock();
        state.owned(self.id, connection).ok().and_then(|c| c.poll_group)
    }

    pub fn pending_messages(&self) -> usize {
        self.network.state.lock().endpoint_mut(self.id).inbound.len()
    }

    /// Simulate a timeout or reset on a live link: both ends see
    /// `ProblemDetectedLocally`.
    pub fn inject_problem(&self, connection: ConnectionHandle, end_debug: &str) -> bool {
        let mut state = self.network.state.lock();
        let live = state
            .owned(self.id, connection)
            .map(|c| c.state.is_live())
            .unwrap_or(false);
        if !live {
            return false;
        }
        let reason = CloseReason::LocalProblem.code();
        state.notify_peer_closed(connection, ConnectionState::ProblemDetectedLocally, reason, end_debug);
        state.transition(connection, ConnectionState::ProblemDetectedLocally, reason, end_debug);
        true
    }

    fn require_initialized(&self, state: &mut NetworkState) -> Result<(), TransportError> {
        if state.endpoint_mut(self.id).initialized {
            Ok(())
        } else {
            Err(TransportError::NotInitialized)
        }
    }
}

impl Transport for MemoryTransport {
    fn init(&self) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let endpoint = state.endpoint_mut(self.id);
        if endpoint.faults.fail_init {
            return Err(TransportError::InitFailed("injected init failure".into()));
        }
        endpoint.initialized = true;
        endpoint.init_count += 1;
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.network.state.lock();
        let owned: Vec<_> = state
            .connections
            .iter()
            .filter(|(_, c)| c.endpoint == self.id)
            .map(|(h, _)| *h)
            .collect();
        for handle in owned {
            state.remove_connection(handle, CloseReason::Unspecified.code(), "Transport shut down");
        }
        state.listeners.retain(|_, l| l.endpoint != self.id);
        state.groups.retain(|_, owner| *owner != self.id);

        let endpoint = state.endpoint_mut(self.id);
        endpoint.inbound.clear();
        endpoint.status_queue.clear();
        endpoint.initialized = false;
        endpoint.shutdown_count += 1;
    }

    fn connect(&self, address: SocketAddr) -> Result<ConnectionHandle, TransportError> {
        let mut state = self.network.state.lock();
        self.require_initialized(&mut state)?;

        let handle = ConnectionHandle::new(state.alloc_handle());
        state.connections.insert(
            handle,
            MemoryConnection {
                endpoint: self.id,
                peer: None,
                state: ConnectionState::None,
                listen_socket: None,
                remote_address: Some(address),
                poll_group: None,
                description: format!("{handle} {address}"),
                end_reason: 0,
                end_debug: String::new(),
            },
        );
        state.transition(handle, ConnectionState::Connecting, 0, "");

        let listener = state
            .listeners
            .iter()
            .find(|(_, l)| l.address.port() == address.port())
            .map(|(socket, l)| (*socket, l.endpoint));
        let listener = listener.filter(|(_, endpoint)| {
            state.endpoints.get(endpoint).is_some_and(|e| e.initialized)
        });

        match listener {
            Some((socket, endpoint)) => {
                let remote = self.local_address();
                let server_handle = ConnectionHandle::new(state.alloc_handle());
                state.connections.insert(
                    server_handle,
                    MemoryConnection {
                        endpoint,
                        peer: Some(handle),
                        state: ConnectionState::None,
                        listen_socket: Some(socket),
                        remote_address: Some(remote),
                        poll_group: None,
                        description: format!("{server_handle} {remote}"),
                        end_reason: 0,
                        end_debug: String::new(),
                    },
                );
                if let Some(conn) = state.connections.get_mut(&handle) {
                    conn.peer = Some(server_handle);
                }
                state.transition(server_handle, ConnectionState::Connecting, 0, "");
                debug!("Memory link {handle} -> {server_handle} pending accept");
            }
            None => {
                let end_debug = format!("Connection refused by {address}");
                state.transition(
                    handle,
                    ConnectionState::ProblemDetectedLocally,
                    CloseReason::LocalProblem.code(),
                    &end_debug,
                );
            }
        }

        Ok(handle)
    }

    fn listen(&self, port: u16) -> Result<ListenSocketHandle, TransportError> {
        let mut state = self.network.state.lock();
        self.require_initialized(&mut state)?;
        if state.endpoint_mut(self.id).faults.fail_listen {
            return Err(TransportError::ListenFailed {
                port,
                reason: "injected listen failure".into(),
            });
        }

        let port = if port == 0 {
            state.next_port += 1;
            EPHEMERAL_PORT_START + state.next_port
        } else {
            port
        };
        if state.listeners.values().any(|l| l.address.port() == port) {
            return Err(TransportError::ListenFailed {
                port,
                reason: "address in use".into(),
            });
        }

        let socket = ListenSocketHandle::new(state.alloc_handle());
        state.listeners.insert(
            socket,
            MemoryListener {
                endpoint: self.id,
                address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            },
        );
        Ok(socket)
    }

    fn listen_address(&self, socket: ListenSocketHandle) -> Option<SocketAddr> {
        let state = self.network.state.lock();
        state
            .listeners
            .get(&socket)
            .filter(|l| l.endpoint == self.id)
            .map(|l| l.address)
    }

    fn close_listen_socket(&self, socket: ListenSocketHandle) -> bool {
        let mut state = self.network.state.lock();
        if !state.listeners.get(&socket).is_some_and(|l| l.endpoint == self.id) {
            return false;
        }
        state.listeners.remove(&socket);
        let accepted: Vec<_> = state
            .connections
            .iter()
            .filter(|(_, c)| c.listen_socket == Some(socket))
            .map(|(h, _)| *h)
            .collect();
        for handle in accepted {
            state.remove_connection(handle, CloseReason::Unspecified.code(), "Listen socket closed");
        }
        true
    }

    fn create_poll_group(&self) -> Result<PollGroupHandle, TransportError> {
        let mut state = self.network.state.lock();
        self.require_initialized(&mut state)?;
        if state.endpoint_mut(self.id).faults.fail_create_poll_group {
            return Err(TransportError::PollGroupFailed("injected poll group failure".into()));
        }
        let group = PollGroupHandle::new(state.alloc_handle());
        state.groups.insert(group, self.id);
        Ok(group)
    }

    fn destroy_poll_group(&self, group: PollGroupHandle) -> bool {
        let mut state = self.network.state.lock();
        if state.groups.get(&group) != Some(&self.id) {
            return false;
        }
        state.groups.remove(&group);
        for conn in state.connections.values_mut() {
            if conn.poll_group == Some(group) {
                conn.poll_group = None;
            }
        }
        true
    }

    fn accept_connection(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let conn = state.owned(self.id, connection)?;
        if conn.listen_socket.is_none() || conn.state != ConnectionState::Connecting {
            return Err(TransportError::InvalidState {
                connection,
                state: conn.state,
            });
        }
        let peer = conn.peer;
        if state.endpoint_mut(self.id).faults.fail_accept {
            return Err(TransportError::InvalidState {
                connection,
                state: ConnectionState::Connecting,
            });
        }

        state.transition(connection, ConnectionState::Connected, 0, "");
        if let Some(peer) = peer {
            state.transition(peer, ConnectionState::Connected, 0, "");
        }
        Ok(())
    }

    fn set_connection_poll_group(
        &self,
        connection: ConnectionHandle,
        group: PollGroupHandle,
    ) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        state.owned(self.id, connection)?;
        if state.groups.get(&group) != Some(&self.id) {
            return Err(TransportError::InvalidPollGroup(group));
        }
        if state.endpoint_mut(self.id).faults.fail_poll_group_assignment {
            return Err(TransportError::InvalidPollGroup(group));
        }
        if let Some(conn) = state.connections.get_mut(&connection) {
            conn.poll_group = Some(group);
        }
        Ok(())
    }

    fn connection_info(&self, connection: ConnectionHandle) -> Option<ConnectionInfo> {
        let state = self.network.state.lock();
        state.owned(self.id, connection).ok()?;
        state.info(connection)
    }

    fn set_connection_name(&self, connection: ConnectionHandle, name: &str) -> bool {
        let mut state = self.network.state.lock();
        match state.connections.get_mut(&connection) {
            Some(conn) if conn.endpoint == self.id => {
                conn.description = name.to_string();
                true
            }
            _ => false,
        }
    }

    fn send(&self, connection: ConnectionHandle, payload: &[u8], _mode: SendMode) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        self.require_initialized(&mut state)?;
        let conn = state.owned(self.id, connection)?;
        let peer = match (conn.state, conn.peer) {
            (ConnectionState::Connected, Some(peer)) => peer,
            (state, _) => return Err(TransportError::InvalidState { connection, state }),
        };
        let Some(peer_endpoint) = state.connections.get(&peer).map(|c| c.endpoint) else {
            return Err(TransportError::InvalidConnection(peer));
        };
        state
            .endpoint_mut(peer_endpoint)
            .inbound
            .push_back(Message::new(peer, payload.to_vec()));
        Ok(())
    }

    fn receive_on_connection(&self, connection: ConnectionHandle, max: usize) -> Result<Vec<Message>, TransportError> {
        let mut state = self.network.state.lock();
        if state.endpoint_mut(self.id).faults.fail_receive {
            return Err(TransportError::ReceiveFailed("injected receive failure".into()));
        }
        state.owned(self.id, connection)?;
        Ok(state.take_messages(self.id, max, |m| m.connection() == connection))
    }

    fn receive_on_poll_group(&self, group: PollGroupHandle, max: usize) -> Result<Vec<Message>, TransportError> {
        let mut state = self.network.state.lock();
        if state.endpoint_mut(self.id).faults.fail_receive {
            return Err(TransportError::ReceiveFailed("injected receive failure".into()));
        }
        if state.groups.get(&group) != Some(&self.id) {
            return Err(TransportError::InvalidPollGroup(group));
        }
        let members: HashSet<ConnectionHandle> = state
            .connections
            .iter()
            .filter(|(_, c)| c.poll_group == Some(group))
            .map(|(h, _)| *h)
            .collect();
        Ok(state.take_messages(self.id, max, |m| members.contains(&m.connection())))
    }

    fn run_callbacks(&self, handler: &mut dyn FnMut(&StatusChange)) {
        let pending: Vec<StatusChange> = {
            let mut state = self.network.state.lock();
            state.endpoint_mut(self.id).status_queue.drain(..).collect()
        };
        for change in &pending {
            handler(change);
        }
    }

    fn close_connection(&self, connection: ConnectionHandle, reason: u32, end_debug: Option<&str>, _linger: bool) -> bool {
        let mut state = self.network.state.lock();
        if state.owned(self.id, connection).is_err() {
            return false;
        }
        state.remove_connection(connection, reason, end_debug.unwrap_or(""))
    }
}
