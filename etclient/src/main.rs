//! etclient — dials etserver, runs the initial-payload handshake, and
//! bridges local stdin/stdout to the encrypted session for as long as the
//! process lives, reconnecting underneath whenever the socket dies.
//!
//! Bootstrapping `ET_CLIENT_ID`/`ET_CLIENT_KEY` (normally done over SSH by
//! the real tool) is out of scope here; both are read from the
//! environment, exactly as the router would hand them to a freshly
//! provisioned client.

use std::net::SocketAddr;
use std::time::Duration;

use et_core::{header, ClientConnection, ClientState, IdleTracker, Packet, SessionError};
use prost::Message as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "etclient exited");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let host = std::env::var("ET_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("ET_SERVER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(2022);
    let client_id = std::env::var("ET_CLIENT_ID").map_err(|_| "ET_CLIENT_ID must be set")?;
    let key = parse_key(&std::env::var("ET_CLIENT_KEY").map_err(|_| "ET_CLIENT_KEY must be set (64 hex chars)")?)?;

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let client = ClientConnection::connect(addr, client_id.clone(), key).await?;
    tracing::info!(%client_id, %addr, "connected");

    let connection = client.connection().clone();
    let initial = et_core::proto::InitialPayload { jumphost: false, reverse_tunnels: Vec::new() };
    connection.write(&Packet::plaintext(header::INITIAL_PAYLOAD, initial.encode_to_vec())).await;

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut read_buf = [0u8; 4096];
    let mut idle = IdleTracker::new();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        if client.state().await == ClientState::Shutdown {
            tracing::error!("server rejected our credentials, exiting");
            break;
        }

        tokio::select! {
            n = stdin.read(&mut read_buf) => {
                match n {
                    Ok(0) => break,
                    Ok(n) => {
                        idle.touch();
                        let payload = et_core::proto::TerminalBuffer { buffer: read_buf[..n].to_vec() }.encode_to_vec();
                        connection.write(&Packet::plaintext(header::TERMINAL_BUFFER, payload)).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            read_result = connection.read() => {
                match read_result {
                    Ok(Some(packet)) => {
                        idle.touch();
                        if let Err(e) = handle_inbound(&packet, &mut stdout).await {
                            tracing::warn!(error = %e, "failed to handle inbound packet");
                        }
                    }
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "read failed, reconnecting");
                        client.spawn_reconnect_worker();
                        wait_for_alive(&client).await;
                    }
                }
            }
            _ = tick.tick() => {
                if idle.client_should_probe() {
                    connection.write(&Packet::plaintext(header::KEEP_ALIVE, Vec::new())).await;
                    idle.touch();
                }
            }
        }
    }

    Ok(())
}

async fn handle_inbound(packet: &Packet, stdout: &mut tokio::io::Stdout) -> Result<(), SessionError> {
    match packet.header {
        header::KEEP_ALIVE => {}
        header::TERMINAL_BUFFER => {
            let msg = et_core::proto::TerminalBuffer::decode(packet.payload.as_slice())
                .map_err(|e| SessionError::BadFrame(format!("TerminalBuffer: {e}")))?;
            stdout.write_all(&msg.buffer).await?;
            stdout.flush().await?;
        }
        header::INITIAL_RESPONSE => {
            let msg = et_core::proto::InitialResponse::decode(packet.payload.as_slice())
                .map_err(|e| SessionError::BadFrame(format!("InitialResponse: {e}")))?;
            if !msg.error.is_empty() {
                tracing::error!(error = %msg.error, "server rejected initial payload");
            }
        }
        other => {
            tracing::warn!(header = other, "unhandled header in client loop");
        }
    }
    Ok(())
}

async fn wait_for_alive(client: &ClientConnection) {
    loop {
        match client.state().await {
            ClientState::Alive | ClientState::Shutdown => return,
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
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
