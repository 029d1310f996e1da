//! Client session tests — lifecycle, callbacks, send path.

mod support;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};

    use net_protocol::*;
    use net_session::{Client, Server, ServerConfig};
    use net_transport::memory::Faults;
    use net_transport::{MemoryNetwork, MemoryTransport, Transport};
    use parking_lot::Mutex;
    use zerocopy::{Immutable, IntoBytes};

    use crate::support::*;

    fn running_server(network: &MemoryNetwork) -> Server<MemoryTransport> {
        let server = Server::new(
            network.endpoint(),
            ServerConfig {
                port: 0,
                session: fast_session(),
            },
        );
        server.start();
        assert!(wait_until(|| server.local_addr().is_some()), "server never came up");
        server
    }

    fn client_on(network: &MemoryNetwork) -> Client<MemoryTransport> {
        Client::with_config(network.endpoint(), fast_session())
    }

    fn connect(client: &Client<MemoryTransport>, server: &Server<MemoryTransport>) {
        let addr = server.local_addr().expect("server address");
        client.connect_to_server(&addr.to_string());
        assert!(
            wait_until(|| client.connection_status() == ConnectionStatus::Connected),
            "client never connected: {:?} {}",
            client.connection_status(),
            client.connection_debug_message()
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connecting
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn reachable_server_connects_once() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = client_on(&network);
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);

        let connected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connected);
        client.set_server_connected_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        connect(&client, &server);
        assert!(client.is_running());
        assert!(wait_until(|| server.client_count() == 1));
        assert!(wait_until(|| connected.load(Ordering::SeqCst) == 1));
        assert!(client.connection_debug_message().is_empty());

        client.disconnect();
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        server.stop();
    }

    #[test]
    fn status_stays_connecting_until_accepted() {
        let network = MemoryNetwork::new();
        let listener = network.endpoint();
        listener.init().unwrap();
        let socket = listener.listen(0).unwrap();
        let addr = listener.listen_address(socket).unwrap();

        let client = client_on(&network);
        let connected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connected);
        client.set_server_connected_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        client.connect_to_server(&addr.to_string());
        assert_eq!(client.connection_status(), ConnectionStatus::Connecting);

        let mut incoming = Vec::new();
        assert!(wait_until(|| {
            incoming.extend(drain_changes(&listener));
            !incoming.is_empty()
        }));
        assert_eq!(client.connection_status(), ConnectionStatus::Connecting);
        assert_eq!(connected.load(Ordering::SeqCst), 0);

        listener.accept_connection(incoming[0].connection).unwrap();
        assert!(wait_until(|| client.connection_status() == ConnectionStatus::Connected));
        assert!(wait_until(|| connected.load(Ordering::SeqCst) == 1));

        client.disconnect();
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        listener.shutdown();
    }

    #[test]
    fn unparseable_address_fails_without_polling() {
        let client = Client::with_config(MemoryTransport::standalone(), fast_session());
        client.connect_to_server("not-an-address");

        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.connection_status(), ConnectionStatus::FailedToConnect);
        assert!(!client.connection_debug_message().is_empty());
        assert!(client.transport().open_connections().is_empty());
        assert_eq!(client.transport().init_count(), 1);
        assert_eq!(client.transport().shutdown_count(), 1);
    }

    #[test]
    fn refused_connection_is_failed_to_connect() {
        let client = Client::with_config(MemoryTransport::standalone(), fast_session());
        let disconnected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnected);
        client.set_server_disconnected_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.connect_to_server("127.0.0.1:4444");
        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.connection_status(), ConnectionStatus::FailedToConnect);
        assert!(client.connection_debug_message().contains("refused"));
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
        assert_eq!(client.transport().shutdown_count(), 1);
    }

    #[test]
    fn transport_init_failure_is_recorded() {
        let transport = MemoryTransport::standalone();
        transport.set_faults(Faults {
            fail_init: true,
            ..Default::default()
        });
        let client = Client::with_config(transport, fast_session());
        client.connect_to_server("127.0.0.1:27020");

        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.connection_status(), ConnectionStatus::FailedToConnect);
        assert!(client.connection_debug_message().contains("initialize"));
        assert_eq!(client.transport().shutdown_count(), 0);
    }

    #[test]
    fn connect_while_running_is_noop() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = client_on(&network);
        connect(&client, &server);

        client.connect_to_server("not-an-address");
        assert_eq!(client.connection_status(), ConnectionStatus::Connected);
        assert_eq!(client.transport().init_count(), 1);

        client.disconnect();
        server.stop();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Disconnecting
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn disconnect_twice_tears_down_once() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = client_on(&network);
        let disconnected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnected);
        client.set_server_disconnected_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        connect(&client, &server);

        client.disconnect();
        client.disconnect();
        assert!(!client.is_running());
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(client.transport().shutdown_count(), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert!(wait_until(|| server.client_count() == 0));

        server.stop();
    }

    #[test]
    fn disconnect_before_connect_is_harmless() {
        let client = Client::with_config(MemoryTransport::standalone(), fast_session());
        client.disconnect();
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(client.transport().shutdown_count(), 0);
    }

    #[test]
    fn kicked_by_server_reports_disconnect() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = client_on(&network);
        let disconnected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnected);
        client.set_server_disconnected_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        connect(&client, &server);
        assert!(wait_until(|| server.client_count() == 1));

        let id = server.connected_clients()[0].id;
        assert!(server.kick_client(id));

        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(client.connection_debug_message(), "Kicked by host");
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(client.transport().shutdown_count(), 1);

        server.stop();
    }

    #[test]
    fn server_shutdown_reaches_client() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = client_on(&network);
        connect(&client, &server);

        server.stop();
        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(client.connection_debug_message(), "Server Shutdown");
    }

    #[test]
    fn receive_failure_stops_pump() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = client_on(&network);
        connect(&client, &server);

        client.transport().set_faults(Faults {
            fail_receive: true,
            ..Default::default()
        });
        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(client.transport().shutdown_count(), 1);

        server.stop();
    }

    #[test]
    fn disconnect_from_callback_does_not_deadlock() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = Arc::new(client_on(&network));

        let weak: Weak<Client<MemoryTransport>> = Arc::downgrade(&client);
        client.set_data_received_callback(move |_| {
            if let Some(client) = weak.upgrade() {
                client.disconnect();
            }
        });
        connect(&client, &server);
        assert!(wait_until(|| server.client_count() == 1));

        assert_eq!(server.send_string_to_all_clients("bye", SendMode::Reliable, None), 1);
        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);

        server.stop();
    }

    #[test]
    fn reconnect_after_disconnect() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = client_on(&network);

        connect(&client, &server);
        client.disconnect();
        connect(&client, &server);
        assert_eq!(client.transport().init_count(), 2);
        assert!(wait_until(|| server.client_count() == 1));

        client.disconnect();
        server.stop();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Data
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn server_messages_reach_data_callback_in_order() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let client = client_on(&network);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        client.set_data_received_callback(move |bytes| sink.lock().push(bytes.to_vec()));
        connect(&client, &server);
        assert!(wait_until(|| server.client_count() == 1));

        let id = server.connected_clients()[0].id;
        for text in ["one", "two", ""] {
            assert!(server.send_string_to_client(id, text, SendMode::Reliable));
        }

        assert!(wait_until(|| received.lock().len() == 3));
        assert_eq!(
            *received.lock(),
            vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]
        );

        client.disconnect();
        server.stop();
    }

    #[test]
    fn send_without_link_is_rejected() {
        let client = Client::with_config(MemoryTransport::standalone(), fast_session());
        assert!(!client.send_buffer(b"nope", SendMode::Reliable));
        assert!(!client.send_string("nope", SendMode::Unreliable));
    }

    #[derive(IntoBytes, Immutable)]
    #[repr(C)]
    struct Position {
        x: u32,
        y: u32,
    }

    #[test]
    fn typed_and_string_sends_reach_server() {
        let network = MemoryNetwork::new();
        let server = running_server(&network);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        server.set_data_received_callback(move |_, bytes| sink.lock().push(bytes.to_vec()));

        let client = client_on(&network);
        connect(&client, &server);

        assert!(client.send_string("hi", SendMode::Reliable));
        let position = Position { x: 1, y: 2 };
        assert!(client.send_data(&position, SendMode::Unreliable));

        assert!(wait_until(|| received.lock().len() == 2));
        let received = received.lock();
        assert_eq!(received[0], b"hi");
        assert_eq!(received[1], position.as_bytes());
        assert_eq!(received[1].len(), 8);

        client.disconnect();
        server.stop();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scripted transport
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn scripted_handshake_drives_status() {
        let client = Client::with_config(ScriptedTransport::new(), fast_session());
        client.connect_to_server("10.0.0.1:27020");
        assert!(wait_until(|| client.transport().with(|s| s.connects.len()) == 1));

        let handle = ConnectionHandle::new(1);
        let connected = ConnectionInfo {
            state: ConnectionState::Connected,
            ..Default::default()
        };
        client
            .transport()
            .push_change(StatusChange::new(handle, ConnectionState::Connecting, connected));
        assert!(wait_until(|| client.connection_status() == ConnectionStatus::Connected));

        client.transport().push_message(handle, b"payload");
        assert!(wait_until(|| client.transport().with(|s| s.inbound.is_empty())));

        client
            .transport()
            .push_closed(handle, ConnectionState::Connected, "peer went away");
        assert!(wait_until(|| !client.is_running()));
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(client.connection_debug_message(), "peer went away");

        let closed = client.transport().with(|s| s.closed.clone());
        assert_eq!(closed.len(), 1, "link must be closed exactly once: {closed:?}");
        assert_eq!(closed[0].0, handle);
        assert_eq!(client.transport().with(|s| s.shutdown_count), 1);
    }

    #[test]
    fn data_queued_with_close_is_delivered_before_disconnect() {
        let client = Client::with_config(ScriptedTransport::new(), fast_session());
        let events = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let log = Arc::clone(&events);
        client.set_data_received_callback(move |bytes| log.lock().push(bytes.to_vec()));
        let log = Arc::clone(&events);
        client.set_server_disconnected_callback(move || log.lock().push(b"<disconnected>".to_vec()));

        client.connect_to_server("10.0.0.1:27020");
        assert!(wait_until(|| client.transport().with(|s| s.connects.len()) == 1));
        let handle = ConnectionHandle::new(1);
        let connected = ConnectionInfo {
            state: ConnectionState::Connected,
            ..Default::default()
        };
        client
            .transport()
            .push_change(StatusChange::new(handle, ConnectionState::Connecting, connected));
        assert!(wait_until(|| client.connection_status() == ConnectionStatus::Connected));

        client.transport().with(|s| {
            for payload in [&b"a"[..], b"b", b"c"] {
                s.late_inbound.push_back(Message::new(handle, payload.to_vec()));
            }
        });
        client
            .transport()
            .push_closed(handle, ConnectionState::Connected, "server closed");
        assert!(wait_until(|| !client.is_running()));

        assert_eq!(
            *events.lock(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"<disconnected>".to_vec()]
        );
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    }
}
