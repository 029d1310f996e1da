//! Server session — accepts clients and tracks them in the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use net_protocol::{
    ClientId, CloseReason, ConnectionState, ListenSocketHandle, Message, PollGroupHandle,
    SendMode, StatusChange, TransportError,
};
use net_transport::Transport;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zerocopy::{Immutable, IntoBytes};

use crate::callbacks::{CallbackSlot, ClientInfoFn, ServerDataFn};
use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::pump::{Pump, PumpDriver};
use crate::registry::{ClientInfo, ClientRegistry};

/// Application requests applied by the pump at the start of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerCommand {
    Kick(ClientId),
    Rename { id: ClientId, name: String },
}

struct ServerShared<T> {
    transport: T,
    port: u16,
    registry: ClientRegistry,
    transport_ready: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
    last_error: RwLock<Option<String>>,
    commands: Mutex<Option<mpsc::UnboundedSender<ServerCommand>>>,
    on_data: CallbackSlot<ServerDataFn>,
    on_client_connected: CallbackSlot<ClientInfoFn>,
    on_client_disconnected: CallbackSlot<ClientInfoFn>,
}

impl<T: Transport> ServerShared<T> {
    fn on_status_changed(&self, change: &StatusChange, group: Option<PollGroupHandle>) {
        let id = change.connection;
        debug!("Connection {id} changed {:?} -> {:?}", change.old_state, change.new_state());

        match change.new_state() {
            ConnectionState::Connecting if change.is_incoming() => self.admit(change, group),
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                match self.registry.get(id) {
                    Some(info) => {
                        self.drain_connection(id);
                        info!("Client {id} disconnected: {}", change.info.end_debug);
                        self.on_client_disconnected.with(|f| f(&info));
                        self.registry.remove(id);
                    }
                    None => debug!("Unregistered connection {id} closed: {}", change.info.end_debug),
                }
                self.transport
                    .close_connection(id, CloseReason::Unspecified.code(), None, false);
            }
            _ => {}
        }
    }

    fn dispatch(&self, message: &Message) {
        let id = message.connection();
        if !self.registry.contains(id) {
            warn!("Dropping message from unregistered connection {id}");
            return;
        }
        if message.is_empty() {
            debug!("Ignoring empty message from {id}");
            return;
        }
        self.on_data.with(|f| f(id, message.payload()));
    }

    /// Deliver whatever is still queued on `id`. Runs before the link is closed.
    fn drain_connection(&self, id: ClientId) {
        loop {
            match self.transport.receive_on_connection(id, 1) {
                Ok(messages) if messages.is_empty() => break,
                Ok(messages) => messages.iter().for_each(|m| self.dispatch(m)),
                Err(e) => {
                    debug!("Could not drain {id} before close: {e}");
                    break;
                }
            }
        }
    }

    /// Accept a pending link, put it in the poll group, register it.
    fn admit(&self, change: &StatusChange, group: Option<PollGroupHandle>) {
        let id = change.connection;
        info!("Incoming connection {}", change.info.description);

        if let Err(e) = self.transport.accept_connection(id) {
            warn!("Failed to accept connection {id}: {e}");
            self.transport
                .close_connection(id, CloseReason::Unspecified.code(), None, false);
            return;
        }

        let assigned = match group {
            Some(group) => self.transport.set_connection_poll_group(id, group),
            None => Err(TransportError::NotInitialized),
        };
        if let Err(e) = assigned {
            warn!("Failed to assign connection {id} to poll group: {e}");
            self.transport
                .close_connection(id, CloseReason::Unspecified.code(), None, false);
            return;
        }

        let info = ClientInfo::new(id, change.info.description.clone());
        self.registry.insert(info.clone());
        info!("Client {id} connected ({} total)", self.registry.len());
        self.on_client_connected.with(|f| f(&info));
    }

    fn enqueue(&self, command: ServerCommand) -> bool {
        match self.commands.lock().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

/// A server session.
///
/// ```no_run
/// use net_session::{SendMode, Server, ServerConfig};
/// use net_transport::TcpTransport;
///
/// let server = Server::new(TcpTransport::default(), ServerConfig::with_port(27020));
/// server.set_data_received_callback(|id, bytes| println!("{id}: {} bytes", bytes.len()));
/// server.start();
/// server.send_string_to_all_clients("hello", SendMode::Reliable, None);
/// server.stop();
/// ```
pub struct Server<T: Transport> {
    shared: Arc<ServerShared<T>>,
    pump: Pump,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                transport,
                port: config.port,
                registry: ClientRegistry::new(),
                transport_ready: AtomicBool::new(false),
                local_addr: RwLock::new(None),
                last_error: RwLock::new(None),
                commands: Mutex::new(None),
                on_data: CallbackSlot::new(),
                on_client_connected: CallbackSlot::new(),
                on_client_disconnected: CallbackSlot::new(),
            }),
            pump: Pump::new(config.session),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Start listening. Returns immediately; a failure to come up is reported
    /// through [`last_error`](Self::last_error). Does nothing while running.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let started = self.pump.start(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            *shared.commands.lock() = Some(tx);
            *shared.last_error.write() = None;
            ServerDriver {
                shared,
                commands: rx,
                listen_socket: None,
                poll_group: None,
                initialized: false,
            }
        });

        if let Err(e) = started {
            warn!("Could not start server: {e}");
            *self.shared.commands.lock() = None;
            *self.shared.last_error.write() = Some(e.to_string());
        }
    }

    /// Stop the pump and wait for every client to be closed.
    pub fn stop(&self) {
        self.pump.stop();
    }

    pub fn is_running(&self) -> bool {
        self.pump.is_running()
    }

    /// Copy of the registry at call time.
    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.shared.registry.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// The bound listen address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.read()
    }

    /// Why the last start failed, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.read().clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Commands (applied on the pump thread)
    // ─────────────────────────────────────────────────────────────────────

    /// Close a client's link with "Kicked by host". Returns false if the id
    /// is not connected or the server is not running.
    pub fn kick_client(&self, id: ClientId) -> bool {
        if !self.shared.registry.contains(id) {
            warn!("Cannot kick {id}: not a connected client");
            return false;
        }
        self.shared.enqueue(ServerCommand::Kick(id))
    }

    /// Set the description shown for a client.
    pub fn rename_client(&self, id: ClientId, name: &str) -> bool {
        if !self.shared.registry.contains(id) {
            warn!("Cannot rename {id}: not a connected client");
            return false;
        }
        self.shared.enqueue(ServerCommand::Rename {
            id,
            name: name.to_string(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────

    /// Hand `data` to the transport for one client. Returns false (and logs)
    /// when the id is not a connected client or the transport rejects it.
    pub fn send_buffer_to_client(&self, id: ClientId, data: &[u8], mode: SendMode) -> bool {
        if !self.shared.transport_ready.load(Ordering::Acquire) {
            warn!("Cannot send to {id}: server is not running");
            return false;
        }
        if !self.shared.registry.contains(id) {
            warn!("Cannot send to {id}: not a connected client");
            return false;
        }
        match self.shared.transport.send(id, data, mode) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {} bytes to {id}: {e}", data.len());
                false
            }
        }
    }

    /// Send to every connected client except `exclude`. Returns how many
    /// sends the transport accepted.
    pub fn send_buffer_to_all_clients(&self, data: &[u8], mode: SendMode, exclude: Option<ClientId>) -> usize {
        self.shared
            .registry
            .ids()
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .filter(|id| self.send_buffer_to_client(*id, data, mode))
            .count()
    }

    pub fn send_string_to_client(&self, id: ClientId, text: &str, mode: SendMode) -> bool {
        self.send_buffer_to_client(id, text.as_bytes(), mode)
    }

    pub fn send_string_to_all_clients(&self, text: &str, mode: SendMode, exclude: Option<ClientId>) -> usize {
        self.send_buffer_to_all_clients(text.as_bytes(), mode, exclude)
    }

    pub fn send_data_to_client<D>(&self, id: ClientId, data: &D, mode: SendMode) -> bool
    where
        D: IntoBytes + Immutable + ?Sized,
    {
        self.send_buffer_to_client(id, data.as_bytes(), mode)
    }

    pub fn send_data_to_all_clients<D>(&self, data: &D, mode: SendMode, exclude: Option<ClientId>) -> usize
    where
        D: IntoBytes + Immutable + ?Sized,
    {
        self.send_buffer_to_all_clients(data.as_bytes(), mode, exclude)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Callbacks (invoked on the pump thread)
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_data_received_callback(&self, callback: impl FnMut(ClientId, &[u8]) + Send + 'static) {
        self.shared.on_data.set(Box::new(callback));
    }

    pub fn set_client_connected_callback(&self, callback: impl FnMut(&ClientInfo) + Send + 'static) {
        self.shared.on_client_connected.set(Box::new(callback));
    }

    pub fn set_client_disconnected_callback(&self, callback: impl FnMut(&ClientInfo) + Send + 'static) {
        self.shared.on_client_disconnected.set(Box::new(callback));
    }
}

struct ServerDriver<T> {
    shared: Arc<ServerShared<T>>,
    commands: mpsc::UnboundedReceiver<ServerCommand>,
    listen_socket: Option<ListenSocketHandle>,
    poll_group: Option<PollGroupHandle>,
    initialized: bool,
}

impl<T: Transport> ServerDriver<T> {
    fn kick(&mut self, id: ClientId) {
        let Some(info) = self.shared.registry.get(id) else {
            debug!("Kick for {id} ignored: already gone");
            return;
        };
        self.shared.transport.close_connection(
            id,
            CloseReason::Kicked.code(),
            Some("Kicked by host"),
            false,
        );
        self.shared.registry.remove(id);
        info!("Kicked client {id}");
        self.shared.on_client_disconnected.with(|f| f(&info));
    }

    fn rename(&mut self, id: ClientId, name: &str) {
        if !self.shared.registry.contains(id) {
            debug!("Rename for {id} ignored: already gone");
            return;
        }
        self.shared.transport.set_connection_name(id, name);
        self.shared.registry.rename(id, name);
        debug!("Renamed client {id} to {name:?}");
    }
}

impl<T: Transport> PumpDriver for ServerDriver<T> {
    fn start(&mut self) -> Result<(), SessionError> {
        let transport = &self.shared.transport;
        let port = self.shared.port;

        transport.init().map_err(SessionError::TransportInit)?;
        self.initialized = true;

        let socket = transport
            .listen(port)
            .map_err(|source| SessionError::Listen { port, source })?;
        self.listen_socket = Some(socket);

        let group = transport.create_poll_group().map_err(SessionError::PollGroup)?;
        self.poll_group = Some(group);

        let addr = transport.listen_address(socket);
        *self.shared.local_addr.write() = addr;
        self.shared.transport_ready.store(true, Ordering::Release);
        match addr {
            Some(addr) => info!("Server listening on {addr}"),
            None => info!("Server listening on port {port}"),
        }
        Ok(())
    }

    fn on_start_failed(&mut self, err: &SessionError) {
        *self.shared.last_error.write() = Some(err.to_string());
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ServerCommand::Kick(id) => self.kick(id),
                ServerCommand::Rename { id, name } => self.rename(id, &name),
            }
        }
    }

    fn poll_incoming_messages(&mut self, running: &AtomicBool) -> Result<(), TransportError> {
        let Some(group) = self.poll_group else {
            return Ok(());
        };

        while running.load(Ordering::Acquire) {
            let messages = self.shared.transport.receive_on_poll_group(group, 1)?;
            if messages.is_empty() {
                break;
            }
            for message in &messages {
                self.shared.dispatch(message);
            }
        }
        Ok(())
    }

    fn poll_connection_state_changes(&mut self) -> bool {
        let shared = &self.shared;
        let group = self.poll_group;
        shared
            .transport
            .run_callbacks(&mut |change: &StatusChange| shared.on_status_changed(change, group));
        true
    }

    fn teardown(&mut self) {
        self.shared.transport_ready.store(false, Ordering::Release);
        self.shared.commands.lock().take();

        for info in self.shared.registry.snapshot() {
            self.shared.on_client_disconnected.with(|f| f(&info));
            self.shared.transport.close_connection(
                info.id,
                CloseReason::ServerShutdown.code(),
                Some("Server Shutdown"),
                true,
            );
        }
        self.shared.registry.drain();

        if let Some(socket) = self.listen_socket.take() {
            self.shared.transport.close_listen_socket(socket);
        }
        if let Some(group) = self.poll_group.take() {
            self.shared.transport.destroy_poll_group(group);
        }
        *self.shared.local_addr.write() = None;

        if self.initialized {
            self.shared.transport.shutdown();
            self.initialized = false;
        }
        info!("Server stopped");
    }
}
