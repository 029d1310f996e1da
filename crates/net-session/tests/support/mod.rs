//! Shared helpers for session tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

use net_protocol::*;
use net_session::SessionConfig;
use net_transport::{MemoryNetwork, MemoryTransport, Transport};
use parking_lot::Mutex;

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or the deadline passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Fast pump cadence for tests.
pub fn fast_session() -> SessionConfig {
    SessionConfig {
        poll_interval: Duration::from_millis(1),
        thread_name: "test-pump".into(),
    }
}

pub fn drain_changes(transport: &impl Transport) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    transport.run_callbacks(&mut |change: &StatusChange| changes.push(change.clone()));
    changes
}

/// A bare transport endpoint connected to `addr` and accepted by the server.
pub struct RawPeer {
    pub transport: MemoryTransport,
    pub connection: ConnectionHandle,
    /// Status changes seen so far.
    pub changes: Vec<StatusChange>,
}

impl RawPeer {
    pub fn connect(network: &MemoryNetwork, addr: SocketAddr) -> Self {
        let transport = network.endpoint();
        transport.init().expect("peer init");
        let connection = transport.connect(addr).expect("peer connect");
        let mut peer = Self {
            transport,
            connection,
            changes: Vec::new(),
        };
        assert!(
            wait_until(|| peer.poll_state() == Some(ConnectionState::Connected)),
            "peer was never accepted"
        );
        peer
    }

    /// Drain status changes and return the latest known state.
    pub fn poll_state(&mut self) -> Option<ConnectionState> {
        self.changes.extend(drain_changes(&self.transport));
        self.changes.last().map(|c| c.new_state())
    }

    pub fn wait_for_close(&mut self) -> Option<StatusChange> {
        let closed = wait_until(|| self.poll_state().is_some_and(|s| s.is_closing()));
        if closed { self.changes.last().cloned() } else { None }
    }

    pub fn send(&self, payload: &[u8]) {
        self.transport
            .send(self.connection, payload, SendMode::Reliable)
            .expect("peer send");
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.transport
            .receive_on_connection(self.connection, 64)
            .map(|msgs| msgs.into_iter().map(|m| m.payload().to_vec()).collect())
            .unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted transport
// ─────────────────────────────────────────────────────────────────────────────

/// A transport whose status changes and inbound messages are injected by the
/// test, and which records every call the session makes.
#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

#[derive(Default)]
pub struct ScriptState {
    pub init_count: usize,
    pub shutdown_count: usize,
    pub changes: VecDeque<StatusChange>,
    pub inbound: VecDeque<Message>,
    pub fail_receive: bool,
    /// Moved into `inbound` when `run_callbacks` takes the pending changes,
    /// as if it arrived between a cycle's receive poll and its callbacks.
    pub late_inbound: VecDeque<Message>,
    pub accepted: Vec<ConnectionHandle>,
    pub assigned: Vec<(ConnectionHandle, PollGroupHandle)>,
    pub closed: Vec<(ConnectionHandle, u32, Option<String>)>,
    pub sends: Vec<(ConnectionHandle, Vec<u8>, SendMode)>,
    pub names: Vec<(ConnectionHandle, String)>,
    pub connects: Vec<SocketAddr>,
    pub listen_socket_closed: bool,
    pub poll_group_destroyed: bool,
}

pub const SCRIPTED_LISTEN: ListenSocketHandle = ListenSocketHandle::new(500);
pub const SCRIPTED_GROUP: PollGroupHandle = PollGroupHandle::new(600);

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Queue an incoming pending link from a listen socket.
    pub fn push_incoming(&self, raw: u32) -> ConnectionHandle {
        let connection = ConnectionHandle::new(raw);
        let info = ConnectionInfo {
            state: ConnectionState::Connecting,
            listen_socket: Some(SCRIPTED_LISTEN),
            remote_address: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000 + raw as u16)),
            description: format!("{connection} scripted"),
            ..Default::default()
        };
        self.push_change(StatusChange::new(connection, ConnectionState::None, info));
        connection
    }

    pub fn push_change(&self, change: StatusChange) {
        self.state.lock().changes.push_back(change);
    }

    pub fn push_closed(&self, connection: ConnectionHandle, old: ConnectionState, debug: &str) {
        let info = ConnectionInfo {
            state: ConnectionState::ClosedByPeer,
            end_debug: debug.into(),
            ..Default::default()
        };
        self.push_change(StatusChange::new(connection, old, info));
    }

    pub fn push_message(&self, connection: ConnectionHandle, payload: &[u8]) {
        self.state
            .lock()
            .inbound
            .push_back(Message::new(connection, payload.to_vec()));
    }
}

impl Transport for ScriptedTransport {
    fn init(&self) -> Result<(), TransportError> {
        self.state.lock().init_count += 1;
        Ok(())
    }

    fn shutdown(&self) {
        self.state.lock().shutdown_count += 1;
    }

    fn connect(&self, address: SocketAddr) -> Result<ConnectionHandle, TransportError> {
        self.state.lock().connects.push(address);
        Ok(ConnectionHandle::new(1))
    }

    fn listen(&self, _port: u16) -> Result<ListenSocketHandle, TransportError> {
        Ok(SCRIPTED_LISTEN)
    }

    fn listen_address(&self, _socket: ListenSocketHandle) -> Option<SocketAddr> {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 27020))
    }

    fn close_listen_socket(&self, _socket: ListenSocketHandle) -> bool {
        self.state.lock().listen_socket_closed = true;
        true
    }

    fn create_poll_group(&self) -> Result<PollGroupHandle, TransportError> {
        Ok(SCRIPTED_GROUP)
    }

    fn destroy_poll_group(&self, _group: PollGroupHandle) -> bool {
        self.state.lock().poll_group_destroyed = true;
        true
    }

    fn accept_connection(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        self.state.lock().accepted.push(connection);
        Ok(())
    }

    fn set_connection_poll_group(
        &self,
        connection: ConnectionHandle,
        group: PollGroupHandle,
    ) -> Result<(), TransportError> {
        self.state.lock().assigned.push((connection, group));
        Ok(())
    }

    fn connection_info(&self, _connection: ConnectionHandle) -> Option<ConnectionInfo> {
        None
    }

    fn set_connection_name(&self, connection: ConnectionHandle, name: &str) -> bool {
        self.state.lock().names.push((connection, name.to_string()));
        true
    }

    fn send(&self, connection: ConnectionHandle, payload: &[u8], mode: SendMode) -> Result<(), TransportError> {
        self.state.lock().sends.push((connection, payload.to_vec(), mode));
        Ok(())
    }

    fn receive_on_connection(&self, connection: ConnectionHandle, max: usize) -> Result<Vec<Message>, TransportError> {
        self.take(max, Some(connection))
    }

    fn receive_on_poll_group(&self, _group: PollGroupHandle, max: usize) -> Result<Vec<Message>, TransportError> {
        self.take(max, None)
    }

    fn run_callbacks(&self, handler: &mut dyn FnMut(&StatusChange)) {
        let pending: Vec<_> = {
            let mut state = self.state.lock();
            let late: Vec<_> = state.late_inbound.drain(..).collect();
            state.inbound.extend(late);
            state.changes.drain(..).collect()
        };
        for change in &pending {
            handler(change);
        }
    }

    fn close_connection(&self, connection: ConnectionHandle, reason: u32, debug: Option<&str>, _linger: bool) -> bool {
        self.state
            .lock()
            .closed
            .push((connection, reason, debug.map(str::to_string)));
        true
    }
}

impl ScriptedTransport {
    fn take(&self, max: usize, connection: Option<ConnectionHandle>) -> Result<Vec<Message>, TransportError> {
        let mut state = self.state.lock();
        if state.fail_receive {
            return Err(TransportError::ReceiveFailed("scripted failure".into()));
        }
        let mut taken = Vec::new();
        let mut idx = 0;
        while idx < state.inbound.len() && taken.len() < max {
            if connection.is_none_or(|c| state.inbound[idx].connection() == c) {
                taken.extend(state.inbound.remove(idx));
            } else {
                idx += 1;
            }
        }
        Ok(taken)
    }
}
