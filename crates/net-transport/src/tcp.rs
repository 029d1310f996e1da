//! TCP transport adapter.
//!
//! Every link is one TCP stream carrying [`Frame`]s. The listening side
//! holds an incoming stream as "pending" until the application accepts it,
//! then answers with an `Accept` frame; the dialing side reports `Connected`
//! only after that frame arrives. Socket I/O runs on a private tokio runtime
//! created by [`Transport::init`]; the [`Transport`] methods themselves are
//! synchronous and safe to call from any thread.
//!
//! TCP is always reliable and ordered, so [`SendMode::Unreliable`] is carried
//! as reliable, and close `linger` is implied (queued frames are flushed
//! before the write half shuts down).

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use net_protocol::{
    CloseReason, ConnectionHandle, ConnectionInfo, ConnectionState, ListenSocketHandle, Message,
    PollGroupHandle, SendMode, StatusChange, TransportError,
};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::{CONTROL_OVERHEAD, Frame, read_frame, write_frame};
use crate::transport::Transport;

/// TCP adapter configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address listen sockets bind to.
    pub bind_address: IpAddr,
    /// How long a dial may take before the link is reported as failed.
    pub connect_timeout: Duration,
    /// Largest payload accepted by `send` or read from the wire.
    pub max_message_size: usize,
    /// Worker threads of the I/O runtime.
    pub worker_threads: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout: Duration::from_secs(10),
            max_message_size: 512 * 1024,
            worker_threads: 1,
        }
    }
}

/// The TCP adapter.
pub struct TcpTransport {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

struct Shared {
    config: TcpTransportConfig,
    state: Mutex<TcpState>,
}

#[derive(Default)]
struct TcpState {
    next_handle: u32,
    io: Option<Handle>,
    connections: HashMap<ConnectionHandle, TcpConnection>,
    listeners: HashMap<ListenSocketHandle, TcpListenerEntry>,
    groups: HashSet<PollGroupHandle>,
    inbound: VecDeque<Message>,
    status_queue: VecDeque<StatusChange>,
}

struct TcpListenerEntry {
    address: SocketAddr,
    task: JoinHandle<()>,
}

struct TcpConnection {
    state: ConnectionState,
    listen_socket: Option<ListenSocketHandle>,
    remote_address: Option<SocketAddr>,
    poll_group: Option<PollGroupHandle>,
    description: String,
    end_reason: u32,
    end_debug: String,
    link: Link,
}

enum Link {
    /// Outgoing stream being dialed. The task becomes the reader once accepted.
    Dialing(JoinHandle<()>),
    /// Incoming stream waiting for `accept_connection`.
    Pending(TcpStream),
    Open {
        outbound: mpsc::UnboundedSender<Frame>,
        reader: JoinHandle<()>,
    },
    Ended,
}

impl TcpConnection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state,
            listen_socket: self.listen_socket,
            remote_address: self.remote_address,
            end_reason: self.end_reason,
            end_debug: self.end_debug.clone(),
            description: self.description.clone(),
        }
    }
}

impl TcpState {
    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn io(&self) -> Result<Handle, TransportError> {
        self.io.clone().ok_or(TransportError::NotInitialized)
    }

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
        let change = StatusChange::new(handle, old_state, conn.info());
        self.status_queue.push_back(change);
    }

    fn take_messages(&mut self, max: usize, matches: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut taken = Vec::new();
        let mut idx = 0;
        while idx < self.inbound.len() && taken.len() < max {
            if matches(&self.inbound[idx]) {
                if let Some(message) = self.inbound.remove(idx) {
                    taken.push(message);
                }
            } else {
                idx += 1;
            }
        }
        taken
    }
}

impl Shared {
    fn max_frame_body(&self) -> usize {
        self.config.max_message_size + CONTROL_OVERHEAD
    }

    fn register_incoming(&self, socket: ListenSocketHandle, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut state = self.state.lock();
        let handle = ConnectionHandle::new(state.alloc_handle());
        state.connections.insert(
            handle,
            TcpConnection {
                state: ConnectionState::None,
                listen_socket: Some(socket),
                remote_address: Some(peer),
                poll_group: None,
                description: format!("{handle} {peer}"),
                end_reason: 0,
                end_debug: String::new(),
                link: Link::Pending(stream),
            },
        );
        state.transition(handle, ConnectionState::Connecting, 0, "");
        debug!("Incoming TCP link {handle} from {peer}");
    }

    /// Dial finished and the peer accepted: wire up the writer and go live.
    fn dial_accepted(&self, handle: ConnectionHandle, writer: OwnedWriteHalf) -> bool {
        let mut state = self.state.lock();
        let Ok(io) = state.io() else {
            return false;
        };
        let Some(conn) = state.connections.get_mut(&handle) else {
            return false;
        };
        if !conn.state.is_handshaking() {
            return false;
        }
        let Link::Dialing(reader) = std::mem::replace(&mut conn.link, Link::Ended) else {
            return false;
        };
        let (outbound, rx) = mpsc::unbounded_channel();
        io.spawn(run_writer(writer, rx));
        conn.link = Link::Open { outbound, reader };
        state.transition(handle, ConnectionState::Connected, 0, "");
        true
    }

    fn deliver(&self, handle: ConnectionHandle, payload: Bytes) {
        let mut state = self.state.lock();
        let connected = state
            .connections
            .get(&handle)
            .is_some_and(|c| c.state == ConnectionState::Connected);
        if connected {
            state.inbound.push_back(Message::new(handle, payload));
        }
    }

    /// The link ended from the network side.
    fn end(&self, handle: ConnectionHandle, new_state: ConnectionState, reason: u32, end_debug: &str) {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(&handle) else {
            return;
        };
        if !conn.state.is_live() {
            return;
        }
        // Dropping the sender lets the writer task finish.
        conn.link = Link::Ended;
        state.transition(handle, new_state, reason, end_debug);
        debug!("TCP link {handle} ended: {end_debug}");
    }
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(TcpState::default()),
            }),
            runtime: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.shared.config
    }

    fn require_connection<'a>(
        state: &'a TcpState,
        handle: ConnectionHandle,
    ) -> Result<&'a TcpConnection, TransportError> {
        state
            .connections
            .get(&handle)
            .ok_or(TransportError::InvalidConnection(handle))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TcpTransportConfig::default())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if self.runtime.lock().is_some() {
            self.shutdown();
        }
    }
}

impl Transport for TcpTransport {
    fn init(&self) -> Result<(), TransportError> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.shared.config.worker_threads.max(1))
            .thread_name("net-tcp-io")
            .enable_all()
            .build()
            .map_err(|e| TransportError::InitFailed(e.to_string()))?;
        self.shared.state.lock().io = Some(rt.handle().clone());
        *runtime = Some(rt);
        debug!("TCP transport initialized");
        Ok(())
    }

    fn shutdown(&self) {
        let Some(rt) = self.runtime.lock().take() else {
            return;
        };

        {
            let mut state = self.shared.state.lock();
            state.io = None;
            for (_, listener) in state.listeners.drain() {
                listener.task.abort();
            }
            for (handle, conn) in state.connections.drain() {
                match conn.link {
                    Link::Open { outbound, reader } => {
                        let _ = outbound.send(Frame::Close {
                            reason: CloseReason::Unspecified.code(),
                            debug: "Transport shut down".into(),
                        });
                        reader.abort();
                    }
                    Link::Dialing(task) => task.abort(),
                    Link::Pending(_) | Link::Ended => {}
                }
                debug!("Dropped TCP link {handle} on shutdown");
            }
            state.groups.clear();
            state.inbound.clear();
            state.status_queue.clear();
        }

        // Writers get a moment to flush close frames.
        if Handle::try_current().is_ok() {
            rt.shutdown_background();
        } else {
            rt.shutdown_timeout(Duration::from_millis(250));
        }
        debug!("TCP transport shut down");
    }

    fn connect(&self, address: SocketAddr) -> Result<ConnectionHandle, TransportError> {
        let mut state = self.shared.state.lock();
        let io = state.io()?;
        let handle = ConnectionHandle::new(state.alloc_handle());

        let shared = Arc::clone(&self.shared);
        let task = io.spawn(run_dialer(shared, handle, address));

        state.connections.insert(
            handle,
            TcpConnection {
                state: ConnectionState::None,
                listen_socket: None,
                remote_address: Some(address),
                poll_group: None,
                description: format!("{handle} {address}"),
                end_reason: 0,
                end_debug: String::new(),
                link: Link::Dialing(task),
            },
        );
        state.transition(handle, ConnectionState::Connecting, 0, "");
        Ok(handle)
    }

    fn listen(&self, port: u16) -> Result<ListenSocketHandle, TransportError> {
        let io = self.shared.state.lock().io()?;
        let bind = SocketAddr::new(self.shared.config.bind_address, port);
        let listen_failed = |e: std::io::Error| TransportError::ListenFailed {
            port,
            reason: e.to_string(),
        };

        let std_listener = std::net::TcpListener::bind(bind).map_err(listen_failed)?;
        std_listener.set_nonblocking(true).map_err(listen_failed)?;
        let address = std_listener.local_addr().map_err(listen_failed)?;
        let listener = {
            let _guard = io.enter();
            tokio::net::TcpListener::from_std(std_listener).map_err(listen_failed)?
        };

        let mut state = self.shared.state.lock();
        let socket = ListenSocketHandle::new(state.alloc_handle());
        let shared = Arc::clone(&self.shared);
        let task = io.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => shared.register_incoming(socket, stream, peer),
                    Err(e) => {
                        warn!("Accept on {address} failed: {e}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });
        state.listeners.insert(socket, TcpListenerEntry { address, task });
        info!("TCP transport listening on {address}");
        Ok(socket)
    }

    fn listen_address(&self, socket: ListenSocketHandle) -> Option<SocketAddr> {
        self.shared.state.lock().listeners.get(&socket).map(|l| l.address)
    }

    fn close_listen_socket(&self, socket: ListenSocketHandle) -> bool {
        let mut state = self.shared.state.lock();
        let Some(listener) = state.listeners.remove(&socket) else {
            return false;
        };
        listener.task.abort();
        // Streams that were never accepted go with the socket.
        state.connections.retain(|_, conn| {
            !(conn.listen_socket == Some(socket) && matches!(conn.link, Link::Pending(_)))
        });
        true
    }

    fn create_poll_group(&self) -> Result<PollGroupHandle, TransportError> {
        let mut state = self.shared.state.lock();
        state.io()?;
        let group = PollGroupHandle::new(state.alloc_handle());
        state.groups.insert(group);
        Ok(group)
    }

    fn destroy_poll_group(&self, group: PollGroupHandle) -> bool {
        let mut state = self.shared.state.lock();
        if !state.groups.remove(&group) {
            return false;
        }
        for conn in state.connections.values_mut() {
            if conn.poll_group == Some(group) {
                conn.poll_group = None;
            }
        }
        true
    }

    fn accept_connection(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        let io = state.io()?;
        let conn = state
            .connections
            .get_mut(&connection)
            .ok_or(TransportError::InvalidConnection(connection))?;
        if conn.state != ConnectionState::Connecting || !matches!(conn.link, Link::Pending(_)) {
            return Err(TransportError::InvalidState {
                connection,
                state: conn.state,
            });
        }
        let Link::Pending(stream) = std::mem::replace(&mut conn.link, Link::Ended) else {
            return Err(TransportError::InvalidState {
                connection,
                state: conn.state,
            });
        };

        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let _ = outbound.send(Frame::Accept);
        io.spawn(run_writer(write_half, rx));
        let reader = io.spawn(run_reader(
            Arc::clone(&self.shared),
            connection,
            read_half,
        ));
        conn.link = Link::Open { outbound, reader };
        state.transition(connection, ConnectionState::Connected, 0, "");
        Ok(())
    }

    fn set_connection_poll_group(
        &self,
        connection: ConnectionHandle,
        group: PollGroupHandle,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if !state.groups.contains(&group) {
            return Err(TransportError::InvalidPollGroup(group));
        }
        let conn = state
            .connections
            .get_mut(&connection)
            .ok_or(TransportError::InvalidConnection(connection))?;
        conn.poll_group = Some(group);
        Ok(())
    }

    fn connection_info(&self, connection: ConnectionHandle) -> Option<ConnectionInfo> {
        let state = self.shared.state.lock();
        state.connections.get(&connection).map(TcpConnection::info)
    }

    fn set_connection_name(&self, connection: ConnectionHandle, name: &str) -> bool {
        let mut state = self.shared.state.lock();
        match state.connections.get_mut(&connection) {
            Some(conn) => {
                conn.description = name.to_string();
                true
            }
            None => false,
        }
    }

    fn send(&self, connection: ConnectionHandle, payload: &[u8], _mode: SendMode) -> Result<(), TransportError> {
        let limit = self.shared.config.max_message_size;
        if payload.len() > limit {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let state = self.shared.state.lock();
        state.io()?;
        let conn = Self::require_connection(&state, connection)?;
        match (&conn.link, conn.state) {
            (Link::Open { outbound, .. }, ConnectionState::Connected) => outbound
                .send(Frame::Data(Bytes::copy_from_slice(payload)))
                .map_err(|_| TransportError::InvalidState {
                    connection,
                    state: conn.state,
                }),
            (_, state) => Err(TransportError::InvalidState { connection, state }),
        }
    }

    fn receive_on_connection(&self, connection: ConnectionHandle, max: usize) -> Result<Vec<Message>, TransportError> {
        let mut state = self.shared.state.lock();
        state.io()?;
        Self::require_connection(&state, connection)?;
        Ok(state.take_messages(max, |m| m.connection() == connection))
    }

    fn receive_on_poll_group(&self, group: PollGroupHandle, max: usize) -> Result<Vec<Message>, TransportError> {
        let mut state = self.shared.state.lock();
        state.io()?;
        if !state.groups.contains(&group) {
            return Err(TransportError::InvalidPollGroup(group));
        }
        let members: HashSet<ConnectionHandle> = state
            .connections
            .iter()
            .filter(|(_, c)| c.poll_group == Some(group))
            .map(|(h, _)| *h)
            .collect();
        Ok(state.take_messages(max, |m| members.contains(&m.connection())))
    }

    fn run_callbacks(&self, handler: &mut dyn FnMut(&StatusChange)) {
        let pending: Vec<StatusChange> = self.shared.state.lock().status_queue.drain(..).collect();
        for change in &pending {
            handler(change);
        }
    }

    fn close_connection(&self, connection: ConnectionHandle, reason: u32, end_debug: Option<&str>, _linger: bool) -> bool {
        let mut state = self.shared.state.lock();
        let Some(conn) = state.connections.remove(&connection) else {
            return false;
        };
        state.inbound.retain(|m| m.connection() != connection);
        state.status_queue.retain(|c| c.connection != connection);

        let close = Frame::Close {
            reason,
            debug: end_debug.unwrap_or_default().to_string(),
        };
        match conn.link {
            Link::Open { outbound, reader } => {
                let _ = outbound.send(close);
                reader.abort();
            }
            Link::Pending(mut stream) => {
                if let Ok(io) = state.io() {
                    io.spawn(async move {
                        let _ = write_frame(&mut stream, &close).await;
                        let _ = stream.shutdown().await;
                    });
                }
            }
            Link::Dialing(task) => task.abort(),
            Link::Ended => {}
        }
        debug!("Closed TCP link {connection} (reason {reason})");
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// I/O tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn run_dialer(shared: Arc<Shared>, handle: ConnectionHandle, address: SocketAddr) {
    let local_problem = CloseReason::LocalProblem.code();
    let timeout = shared.config.connect_timeout;

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            shared.end(handle, ConnectionState::ProblemDetectedLocally, local_problem, &e.to_string());
            return;
        }
        Err(_) => {
            let end_debug = format!("Timed out connecting to {address}");
            shared.end(handle, ConnectionState::ProblemDetectedLocally, local_problem, &end_debug);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (mut read_half, write_half) = stream.into_split();

    match read_frame(&mut read_half, shared.max_frame_body()).await {
        Ok(Some(Frame::Accept)) => {
            if !shared.dial_accepted(handle, write_half) {
                return;
            }
        }
        Ok(Some(Frame::Close { reason, debug: end_debug })) => {
            shared.end(handle, ConnectionState::ClosedByPeer, reason, &end_debug);
            return;
        }
        Ok(Some(Frame::Data(_))) => {
            shared.end(handle, ConnectionState::ProblemDetectedLocally, local_problem, "Data before accept");
            return;
        }
        Ok(None) => {
            shared.end(handle, ConnectionState::ClosedByPeer, CloseReason::Unspecified.code(), "Connection closed by remote host");
            return;
        }
        Err(e) => {
            shared.end(handle, ConnectionState::ProblemDetectedLocally, local_problem, &e.to_string());
            return;
        }
    }

    run_reader(shared, handle, read_half).await;
}

async fn run_reader(shared: Arc<Shared>, handle: ConnectionHandle, mut reader: OwnedReadHalf) {
    let max_body = shared.max_frame_body();
    let local_problem = CloseReason::LocalProblem.code();
    loop {
        match read_frame(&mut reader, max_body).await {
            Ok(Some(Frame::Data(payload))) => shared.deliver(handle, payload),
            Ok(Some(Frame::Close { reason, debug: end_debug })) => {
                shared.end(handle, ConnectionState::ClosedByPeer, reason, &end_debug);
                return;
            }
            Ok(Some(Frame::Accept)) => debug!("Ignoring repeated accept on {handle}"),
            Ok(None) => {
                shared.end(
                    handle,
                    ConnectionState::ProblemDetectedLocally,
                    local_problem,
                    "Connection closed by remote host",
                );
                return;
            }
            Err(e) => {
                shared.end(handle, ConnectionState::ProblemDetectedLocally, local_problem, &e.to_string());
                return;
            }
        }
    }
}

async fn run_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Frame::Close { .. });
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("TCP write failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
