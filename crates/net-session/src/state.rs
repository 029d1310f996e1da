//! Client connection state machine.
//!
//! [`ConnectionTracker`] is pure: it consumes transport status changes and
//! returns the [`ClientAction`]s the pump must perform. It never touches the
//! transport or the callbacks itself, which keeps every transition testable
//! without threads.

use std::sync::atomic::{AtomicU8, Ordering};

use net_protocol::{ConnectionHandle, ConnectionState, ConnectionStatus, StatusChange};

/// Side effects requested by the tracker, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    /// Release the transport link.
    CloseConnection(ConnectionHandle),
    NotifyConnected,
    NotifyDisconnected,
    /// The client has no link left; the pump should exit.
    Stop,
}

/// What teardown has to clean up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownOutcome {
    pub close: Option<ConnectionHandle>,
    pub was_connected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    status: ConnectionStatus,
    connection: Option<ConnectionHandle>,
    debug_message: String,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// The current link. `Some` only while connecting or connected.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection
    }

    pub fn debug_message(&self) -> &str {
        &self.debug_message
    }

    /// A connect call returned a handle.
    pub fn begin_connect(&mut self, connection: ConnectionHandle) {
        self.status = ConnectionStatus::Connecting;
        self.connection = Some(connection);
        self.debug_message.clear();
    }

    /// The session could not get as far as a connect call.
    pub fn fail_to_start(&mut self, reason: impl Into<String>) {
        self.status = ConnectionStatus::FailedToConnect;
        self.connection = None;
        self.debug_message = reason.into();
    }

    pub fn on_status_changed(&mut self, change: &StatusChange) -> Vec<ClientAction> {
        match change.new_state() {
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                let prior = change.old_state;
                self.status = if prior.is_handshaking() {
                    ConnectionStatus::FailedToConnect
                } else {
                    ConnectionStatus::Disconnected
                };
                self.debug_message = change.info.end_debug.clone();
                self.connection = None;

                let mut actions = vec![ClientAction::CloseConnection(change.connection)];
                if prior == ConnectionState::Connected {
                    actions.push(ClientAction::NotifyDisconnected);
                }
                actions.push(ClientAction::Stop);
                actions
            }
            ConnectionState::Connected => {
                self.status = ConnectionStatus::Connected;
                vec![ClientAction::NotifyConnected]
            }
            ConnectionState::None | ConnectionState::Connecting | ConnectionState::FindingRoute => {
                Vec::new()
            }
        }
    }

    /// Leave the session. A failed attempt keeps `FailedToConnect`.
    pub fn on_teardown(&mut self) -> TeardownOutcome {
        let was_connected = self.status == ConnectionStatus::Connected;
        if self.status.handle_is_valid() {
            self.status = ConnectionStatus::Disconnected;
        }
        TeardownOutcome {
            close: self.connection.take(),
            was_connected,
        }
    }
}

/// Lock-free published copy of the client status.
#[derive(Debug, Default)]
pub struct AtomicConnectionStatus(AtomicU8);

impl AtomicConnectionStatus {
    pub fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status.as_u8()))
    }

    pub fn load(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: ConnectionStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }
}
