//! Ultra Net — message-oriented client/server sessions over TCP
//!
//! A small chat relay built on the session layer. The server rebroadcasts
//! every message it receives to all other connected clients; the client
//! sends each line typed on stdin and prints whatever the server relays.
//!
//! Usage:
//!   ultra-net server                            # Listen on the default port 27020
//!   ultra-net server --port 0                   # OS-assigned port
//!   ultra-net client 127.0.0.1                  # Connect to the default port
//!   ultra-net client example.com:27020          # Host names are resolved first
//!
//! Server console commands: `/clients`, `/kick <id>`, `/quit`.
//! Client console commands: `/quit`.

use std::io::BufRead;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use net_protocol::{is_valid_ip_address, resolve_domain_name};
use net_session::{Client, ClientId, ConnectionStatus, SendMode, Server, ServerConfig};
use net_transport::{TcpTransport, TcpTransportConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ultra-net", about = "Ultra Net — client/server message sessions")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.ultra/logs/net.log if no path given)
    #[arg(long, global = true, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Accept clients and relay their messages to each other
    Server {
        /// Port to listen on (0 for OS-assigned)
        #[arg(long, default_value = "27020")]
        port: u16,

        /// Address to bind to
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,
    },
    /// Connect to a server and chat over stdin
    Client {
        /// Server address: `ip`, `ip:port`, `host`, or `host:port`
        target: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    match cli.mode {
        Mode::Server { port, bind } => run_server(port, bind),
        Mode::Client { target } => run_client(&target),
    }
}

fn init_logging(verbose: bool, log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let Some(log_file_arg) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    };

    let log_path = if log_file_arg == "DEFAULT" {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".ultra/logs/net.log")
    } else {
        PathBuf::from(log_file_arg)
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

fn run_server(port: u16, bind: IpAddr) -> anyhow::Result<()> {
    let transport = TcpTransport::new(TcpTransportConfig {
        bind_address: bind,
        ..Default::default()
    });
    let server = Arc::new(Server::new(transport, ServerConfig::with_port(port)));

    server.set_client_connected_callback(|client| {
        println!("+ {} connected ({})", client.id.raw(), client.connection_desc);
    });
    server.set_client_disconnected_callback(|client| {
        println!("- {} disconnected ({})", client.id.raw(), client.connection_desc);
    });

    // The callback lives inside the server, so it only holds a weak reference.
    let relay = Arc::downgrade(&server);
    server.set_data_received_callback(move |from, data| {
        let Some(server) = relay.upgrade() else { return };
        let text = String::from_utf8_lossy(data);
        println!("[{}] {text}", from.raw());
        let line = format!("[{}] {text}", from.raw());
        server.send_string_to_all_clients(&line, SendMode::Reliable, Some(from));
    });

    server.start();
    if !wait_for(|| server.local_addr().is_some() || !server.is_running()) || server.local_addr().is_none() {
        let reason = server.last_error().unwrap_or_else(|| "server did not come up".into());
        bail!("Failed to start server on port {port}: {reason}");
    }

    println!();
    println!("  Ultra Net server");
    if let Some(addr) = server.local_addr() {
        println!("  Listening:  {addr}");
    }
    println!("  Commands:   /clients, /kick <id>, /quit");
    println!();

    for line in std::io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !server.is_running() {
            warn!("Server pump stopped");
            break;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/clients", _) => {
                let clients = server.connected_clients();
                println!("{}", serde_json::to_string_pretty(&clients)?);
            }
            ("/kick", arg) => match arg.trim().parse::<u32>() {
                Ok(raw) => {
                    if !server.kick_client(ClientId::new(raw)) {
                        println!("No client {raw}");
                    }
                }
                Err(_) => println!("Usage: /kick <id>"),
            },
            _ => {
                let sent = server.send_string_to_all_clients(&format!("[host] {line}"), SendMode::Reliable, None);
                info!("Host message delivered to {sent} client(s)");
            }
        }
    }

    server.stop();
    println!("Server stopped");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

fn run_client(target: &str) -> anyhow::Result<()> {
    let address = resolve_target(target)?;
    let client = Client::new(TcpTransport::default());

    client.set_server_connected_callback(|| println!("Connected"));
    client.set_server_disconnected_callback(|| println!("Disconnected"));
    client.set_data_received_callback(|data| println!("{}", String::from_utf8_lossy(data)));

    info!("Connecting to {address}");
    client.connect_to_server(&address);
    wait_for(|| client.connection_status() != ConnectionStatus::Connecting);

    match client.connection_status() {
        ConnectionStatus::Connected => {}
        status => {
            client.disconnect();
            bail!("Could not connect to {address} ({status:?}): {}", client.connection_debug_message());
        }
    }

    for line in std::io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if client.connection_status() != ConnectionStatus::Connected {
            println!("Connection lost: {}", client.connection_debug_message());
            break;
        }
        if !line.is_empty() && !client.send_string(line, SendMode::Reliable) {
            warn!("Message was not sent");
        }
    }

    client.disconnect();
    Ok(())
}

/// Turn `host[:port]` into an IP literal the session accepts, resolving the
/// host name if needed.
fn resolve_target(target: &str) -> anyhow::Result<String> {
    if is_valid_ip_address(target) {
        return Ok(target.to_string());
    }

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => (host, Some(port)),
        _ => (target, None),
    };

    let ip = resolve_domain_name(host).with_context(|| format!("Could not resolve {host}"))?;
    let ip: IpAddr = ip.parse().with_context(|| format!("Resolver returned {ip}"))?;
    Ok(match port {
        Some(port) => SocketAddr::new(ip, port.parse()?).to_string(),
        None => ip.to_string(),
    })
}

/// Poll `cond` for up to ten seconds.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
