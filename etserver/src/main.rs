//! etserver — accepts Eternal Terminal client connections, registers PTY
//! owners over the local router socket, and bridges each client's session
//! between its PTY, its port forwards, and the encrypted wire.

mod jumphost;
mod pty;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use et_core::{
    header, AcceptOutcome, Connection, Endpoint, IdleTracker, Packet, PortForwardHandler,
    ServerConnection, TerminalHandoff, UserTerminalRouter,
};
use prost::Message as _;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const DEFAULT_PORT: u16 = 2022;

#[tokio::main]
async fn main() {
    env_logger::init();

    let result = if std::env::var("ET_JUMPHOST_DESTINATION").is_ok() { jumphost::run_dial().await } else { run().await };

    if let Err(e) = result {
        tracing::error!(error = %e, "etserver exited");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let port: u16 = std::env::var("ET_SERVER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let router_path = et_core::router::default_router_path()?;
    let router = Arc::new(UserTerminalRouter::bind(&router_path)?);
    let server = Arc::new(ServerConnection::new());

    tracing::info!(%addr, router_path = %router_path.display(), "etserver starting");

    tokio::spawn(router_accept_loop(Arc::clone(&router), Arc::clone(&server)));

    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = Arc::clone(&server);
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            match server.accept(stream).await {
                Ok(AcceptOutcome::NewClient { client_id, connection }) => {
                    tracing::info!(%peer, %client_id, "new client");
                    tokio::spawn(session_loop(client_id, connection, router));
                }
                Ok(AcceptOutcome::Recovered { client_id, .. }) => {
                    tracing::info!(%peer, %client_id, "client recovered in place");
                }
                Ok(AcceptOutcome::Rejected) => {
                    tracing::warn!(%peer, "rejected connect attempt");
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "accept failed");
                }
            }
        });
    }
}

/// Drains `IDPASSKEY` registrations off the router socket for as long as the
/// server runs, feeding each `(client_id, key)` into the registry so a
/// subsequent `ConnectRequest` for that id is accepted.
async fn router_accept_loop(router: Arc<UserTerminalRouter>, server: Arc<ServerConnection>) {
    loop {
        match router.accept_new_connection().await {
            Ok((client_id, passkey)) => match parse_key(&passkey) {
                Ok(key) => {
                    if server.add_client_key(client_id.clone(), key).await {
                        tracing::info!(%client_id, "registered client key via router");
                    } else {
                        tracing::warn!(%client_id, "rejected re-registration with mismatched passkey");
                    }
                }
                Err(e) => tracing::warn!(%client_id, %e, "bad passkey from router"),
            },
            Err(e) => tracing::warn!(error = %e, "router accept failed"),
        }
    }
}

fn parse_key(hex: &str) -> Result<[u8; 32], String> {
    if hex.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex.len()));
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|e| e.to_string())?;
    }
    Ok(key)
}

/// One client's session for its entire lifetime, including across
/// reconnects — `connection` stays the same `Arc<Connection>` while its
/// underlying socket is swapped out by `ServerConnection::accept`'s recover
/// path, so this loop never needs to know a reconnect happened.
async fn session_loop(client_id: String, connection: Arc<Connection>, router: Arc<UserTerminalRouter>) {
    let Some(info) = router.take_info(&client_id).await else {
        tracing::error!(%client_id, "no terminal registered for this client id, closing");
        connection.shutdown();
        return;
    };

    let (pty_master_fd, mut owner_stream) = match info.handoff {
        TerminalHandoff::Pty { fd, stream } => (fd, stream),
        TerminalHandoff::Jumphost(stream) => {
            tracing::info!(%client_id, "relaying session to jumphost registration");
            jumphost::relay(client_id, connection, stream).await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Packet>();
    let port_forward = PortForwardHandler::new(outbound_tx);

    let mut pty_rx = pty::spawn_reader(pty_master_fd);
    let mut idle = IdleTracker::new();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            read_result = connection.read() => {
                match read_result {
                    Ok(Some(packet)) => {
                        idle.touch();
                        if let Err(e) = dispatch_inbound(&packet, &connection, &port_forward, pty_master_fd, &mut owner_stream).await {
                            tracing::warn!(%client_id, error = %e, "failed to handle inbound packet");
                        }
                    }
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(e) => {
                        tracing::warn!(%client_id, error = %e, "read failed, waiting for reconnect");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            chunk = pty_rx.recv() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        let payload = et_core::proto::TerminalBuffer { buffer: bytes }.encode_to_vec();
                        connection.write(&Packet::plaintext(header::TERMINAL_BUFFER, payload)).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%client_id, error = %e, "pty read failed, ending session");
                        break;
                    }
                    None => {
                        tracing::info!(%client_id, "pty closed, ending session");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                if let Some(packet) = outbound {
                    connection.write(&packet).await;
                }
            }
            _ = tick.tick() => {
                if idle.server_should_give_up() {
                    tracing::info!(%client_id, "idle timeout, ending session");
                    break;
                }
            }
        }
    }

    connection.shutdown();
}

async fn dispatch_inbound(
    packet: &Packet,
    connection: &Arc<Connection>,
    port_forward: &Arc<PortForwardHandler>,
    pty_fd: RawFd,
    owner_stream: &mut tokio::net::UnixStream,
) -> Result<(), Box<dyn std::error::Error>> {
    match packet.header {
        header::KEEP_ALIVE => {
            connection.write(&Packet::plaintext(header::KEEP_ALIVE, Vec::new())).await;
        }
        header::TERMINAL_BUFFER => {
            let msg = et_core::proto::TerminalBuffer::decode(packet.payload.as_slice())?;
            pty::write_all(pty_fd, &msg.buffer)?;
        }
        header::TERMINAL_INFO => {
            let msg = et_core::proto::TerminalInfo::decode(packet.payload.as_slice())?;
            pty::set_window_size(pty_fd, msg.row as u16, msg.column as u16, msg.width as u16, msg.height as u16)?;
        }
        header::PORT_FORWARD_DESTINATION_REQUEST | header::PORT_FORWARD_DESTINATION_RESPONSE | header::PORT_FORWARD_DATA => {
            if let Some(response) = port_forward.handle_packet(packet).await? {
                connection.write(&response).await;
            }
        }
        header::INITIAL_PAYLOAD => {
            let msg = et_core::proto::InitialPayload::decode(packet.payload.as_slice())?;
            tracing::info!(jumphost = msg.jumphost, reverse_tunnels = msg.reverse_tunnels.len(), "initial payload");

            // Env-var forwards (spec §4.5) bind a freshly generated UNIX path
            // instead of a client-supplied one; the path is reported to the
            // PTY owner as a TERMINAL_INIT environment pair rather than back
            // to the client, since it's the owner's shell that needs to see
            // the env var (e.g. SSH_AUTH_SOCK).
            let mut env_pairs = Vec::new();
            for tunnel in &msg.reverse_tunnels {
                let dest = et_core::proto::PortForwardDestinationRequest {
                    name: tunnel.destination_name.clone(),
                    port: tunnel.destination_port,
                };
                if !tunnel.env_var.is_empty() {
                    let path = et_core::portforward::generate_env_socket_path();
                    port_forward.create_source(Endpoint::Unix(path.clone()), dest).await?;
                    env_pairs.push((tunnel.env_var.clone(), path.display().to_string()));
                } else {
                    let source = if tunnel.source_name.is_empty() {
                        Endpoint::Tcp(format!("127.0.0.1:{}", tunnel.source_port).parse().unwrap())
                    } else {
                        Endpoint::Unix(tunnel.source_name.clone().into())
                    };
                    port_forward.create_source(source, dest).await?;
                }
            }
            if !env_pairs.is_empty() {
                let term_init = et_core::proto::TermInit {
                    environment_names: env_pairs.iter().map(|(k, _)| k.clone()).collect(),
                    environment_values: env_pairs.iter().map(|(_, v)| v.clone()).collect(),
                };
                et_core::packet::write_packet(owner_stream, &Packet::plaintext(header::TERMINAL_INIT, term_init.encode_to_vec())).await?;
            }

            let response = et_core::proto::InitialResponse { error: String::new() };
            connection.write(&Packet::plaintext(header::INITIAL_RESPONSE, response.encode_to_vec())).await;
        }
        other => {
            tracing::warn!(header = other, "unhandled header in session loop");
        }
    }
    Ok(())
}
