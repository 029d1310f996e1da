//! Client session — one link to a server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use net_protocol::{
    CloseReason, ConnectionHandle, ConnectionStatus, SendMode, StatusChange, TransportError,
    parse_peer_address,
};
use net_transport::Transport;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use zerocopy::{Immutable, IntoBytes};

use crate::callbacks::{CallbackSlot, ClientDataFn, ClientEventFn};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::pump::{Pump, PumpDriver};
use crate::state::{AtomicConnectionStatus, ClientAction, ConnectionTracker};

/// State shared between the application and the pump thread.
struct ClientShared<T> {
    transport: T,
    status: AtomicConnectionStatus,
    connection: RwLock<Option<ConnectionHandle>>,
    debug_message: RwLock<String>,
    transport_ready: AtomicBool,
    on_data: CallbackSlot<ClientDataFn>,
    on_connected: CallbackSlot<ClientEventFn>,
    on_disconnected: CallbackSlot<ClientEventFn>,
}

impl<T> ClientShared<T> {
    /// Make the tracker's view visible to application threads.
    fn publish(&self, tracker: &ConnectionTracker) {
        *self.connection.write() = tracker.connection();
        *self.debug_message.write() = tracker.debug_message().to_string();
        self.status.store(tracker.status());
    }
}

impl<T: Transport> ClientShared<T> {
    /// Deliver whatever is still queued on `connection`. Runs before the link
    /// is closed.
    fn drain_connection(&self, connection: ConnectionHandle) {
        loop {
            match self.transport.receive_on_connection(connection, 1) {
                Ok(messages) if messages.is_empty() => break,
                Ok(messages) => {
                    for message in &messages {
                        self.on_data.with(|f| f(message.payload()));
                    }
                }
                Err(e) => {
                    debug!("Could not drain {connection} before close: {e}");
                    break;
                }
            }
        }
    }
}

/// A client session.
///
/// ```no_run
/// use net_session::{Client, ConnectionStatus, SendMode};
/// use net_transport::TcpTransport;
///
/// let client = Client::new(TcpTransport::default());
/// client.set_data_received_callback(|bytes| println!("{} bytes", bytes.len()));
/// client.connect_to_server("127.0.0.1:27020");
/// client.send_string("hello", SendMode::Reliable);
/// client.disconnect();
/// ```
pub struct Client<T: Transport> {
    shared: Arc<ClientShared<T>>,
    pump: Pump,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                transport,
                status: AtomicConnectionStatus::default(),
                connection: RwLock::new(None),
                debug_message: RwLock::new(String::new()),
                transport_ready: AtomicBool::new(false),
                on_data: CallbackSlot::new(),
                on_connected: CallbackSlot::new(),
                on_disconnected: CallbackSlot::new(),
            }),
            pump: Pump::new(config),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &SessionConfig {
        self.pump.config()
    }

    /// Start connecting to `address` (`ip` or `ip:port`, IPv4 or IPv6).
    ///
    /// Returns immediately; progress is visible through
    /// [`connection_status`](Self::connection_status) and the callbacks. Does
    /// nothing while the pump is already running.
    pub fn connect_to_server(&self, address: &str) {
        let shared = Arc::clone(&self.shared);
        let address = address.to_string();
        let started = self.pump.start(|| {
            shared.debug_message.write().clear();
            shared.status.store(ConnectionStatus::Connecting);
            ClientDriver {
                shared,
                address,
                tracker: ConnectionTracker::new(),
                initialized: false,
            }
        });

        if let Err(e) = started {
            warn!("Could not start client: {e}");
            let mut tracker = ConnectionTracker::new();
            tracker.fail_to_start(e.to_string());
            self.shared.publish(&tracker);
        }
    }

    /// Stop the pump and wait for it to tear the link down.
    pub fn disconnect(&self) {
        self.pump.stop();
    }

    pub fn is_running(&self) -> bool {
        self.pump.is_running()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.status.load()
    }

    /// Reason for the last failure or disconnect. Empty if none.
    pub fn connection_debug_message(&self) -> String {
        self.shared.debug_message.read().clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────

    /// Hand `data` to the transport. Returns false (and logs) when there is
    /// no usable link or the transport rejects the message; nothing is queued.
    pub fn send_buffer(&self, data: &[u8], mode: SendMode) -> bool {
        if !self.shared.transport_ready.load(Ordering::Acquire) {
            warn!("Cannot send: client is not running");
            return false;
        }
        let Some(connection) = *self.shared.connection.read() else {
            warn!("Cannot send: not connected");
            return false;
        };
        match self.shared.transport.send(connection, data, mode) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {} bytes on {connection}: {e}", data.len());
                false
            }
        }
    }

    pub fn send_string(&self, text: &str, mode: SendMode) -> bool {
        self.send_buffer(text.as_bytes(), mode)
    }

    /// Send the raw bytes of a plain-data value.
    pub fn send_data<D>(&self, data: &D, mode: SendMode) -> bool
    where
        D: IntoBytes + Immutable + ?Sized,
    {
        self.send_buffer(data.as_bytes(), mode)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Callbacks (invoked on the pump thread)
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_data_received_callback(&self, callback: impl FnMut(&[u8]) + Send + 'static) {
        self.shared.on_data.set(Box::new(callback));
    }

    pub fn set_server_connected_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.shared.on_connected.set(Box::new(callback));
    }

    pub fn set_server_disconnected_callback(&self, callback: impl FnMut() + Send + 'static) {
        self.shared.on_disconnected.set(Box::new(callback));
    }
}

struct ClientDriver<T> {
    shared: Arc<ClientShared<T>>,
    address: String,
    tracker: ConnectionTracker,
    initialized: bool,
}

impl<T: Transport> PumpDriver for ClientDriver<T> {
    fn start(&mut self) -> Result<(), SessionError> {
        let transport = &self.shared.transport;
        transport.init().map_err(SessionError::TransportInit)?;
        self.initialized = true;
        self.shared.transport_ready.store(true, Ordering::Release);

        let addr = parse_peer_address(&self.address).map_err(|source| SessionError::InvalidAddress {
            address: self.address.clone(),
            source,
        })?;

        info!("Connecting to server at {addr}");
        let connection = transport.connect(addr).map_err(SessionError::Connect)?;
        self.tracker.begin_connect(connection);
        self.shared.publish(&self.tracker);
        Ok(())
    }

    fn on_start_failed(&mut self, err: &SessionError) {
        self.tracker.fail_to_start(err.to_string());
        self.shared.publish(&self.tracker);
    }

    fn poll_incoming_messages(&mut self, running: &AtomicBool) -> Result<(), TransportError> {
        let Some(connection) = self.tracker.connection() else {
            return Ok(());
        };

        while running.load(Ordering::Acquire) {
            let messages = self.shared.transport.receive_on_connection(connection, 1)?;
            if messages.is_empty() {
                break;
            }
            for message in messages {
                self.shared.on_data.with(|f| f(message.payload()));
            }
        }
        Ok(())
    }

    fn poll_connection_state_changes(&mut self) -> bool {
        let shared = &self.shared;
        let tracker = &mut self.tracker;
        let mut keep_running = true;

        shared.transport.run_callbacks(&mut |change: &StatusChange| {
            debug!(
                "Connection {} changed {:?} -> {:?}",
                change.connection,
                change.old_state,
                change.new_state()
            );
            let actions = tracker.on_status_changed(change);
            shared.publish(tracker);

            for action in actions {
                match action {
                    ClientAction::CloseConnection(connection) => {
                        info!("Connection to server ended: {}", change.info.end_debug);
                        shared.drain_connection(connection);
                        shared.transport.close_connection(
                            connection,
                            CloseReason::Unspecified.code(),
                            None,
                            false,
                        );
                    }
                    ClientAction::NotifyConnected => {
                        info!("Connected to server ({})", change.info.description);
                        shared.on_connected.with(|f| f());
                    }
                    ClientAction::NotifyDisconnected => {
                        shared.on_disconnected.with(|f| f());
                    }
                    ClientAction::Stop => keep_running = false,
                }
            }
        });

        keep_running
    }

    fn teardown(&mut self) {
        let outcome = self.tracker.on_teardown();
        if let Some(connection) = outcome.close {
            self.shared.transport.close_connection(
                connection,
                CloseReason::Application.code(),
                Some("Client disconnected"),
                false,
            );
        }
        self.shared.publish(&self.tracker);
        self.shared.transport_ready.store(false, Ordering::Release);

        if outcome.was_connected {
            self.shared.on_disconnected.with(|f| f());
        }

        if self.initialized {
            self.shared.transport.shutdown();
            self.initialized = false;
        }
        debug!("Client session torn down");
    }
}
