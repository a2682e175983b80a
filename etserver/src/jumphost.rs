//! Jumphost relay, spec §2/§3.6: a jumphost never touches a PTY. It
//! registers with a router (its own or, when it's itself the relay
//! process, the next hop's) and forwards `Packet`s opaquely between that
//! registration socket and a genuine `ClientConnection` to the real
//! destination.
//!
//! Two halves live here:
//! - [`relay`] runs inside `etserver`'s normal accept loop whenever a
//!   client's registration turned out to be [`et_core::TerminalHandoff::Jumphost`]
//!   rather than a PTY fd: it bridges that client's `Connection` with the
//!   still-open router registration socket.
//! - [`run_dial`] is the standalone process that runs *on* the jumphost
//!   host: it registers with the local router as a jumphost, then dials the
//!   real destination as a `ClientConnection` and relays in the other
//!   direction. Grounded on `UserJumphostHandler.cpp`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use et_core::{packet, ClientConnection, Connection};
use tokio::net::UnixStream;

/// Bridge `connection` (the real client's encrypted session) with `stream`
/// (the jumphost process's plain, packet-framed registration socket),
/// forwarding every `Packet` untouched in both directions until either side
/// closes.
pub async fn relay(client_id: String, connection: Arc<Connection>, stream: UnixStream) {
    let (mut router_read, mut router_write) = stream.into_split();

    let forward_to_router = {
        let connection = Arc::clone(&connection);
        let client_id = client_id.clone();
        tokio::spawn(async move {
            loop {
                match connection.read().await {
                    Ok(Some(packet)) => {
                        if packet::write_packet(&mut router_write, &packet).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => tokio::time::sleep(Duration::from_millis(200)).await,
                    Err(e) => {
                        tracing::warn!(%client_id, error = %e, "jumphost relay: client read failed");
                        return;
                    }
                }
            }
        })
    };

    loop {
        match packet::read_packet(&mut router_read).await {
            Ok(Some(packet)) => {
                connection.write(&packet).await;
            }
            Ok(None) | Err(_) => break,
        }
    }

    forward_to_router.abort();
    connection.shutdown();
    tracing::info!(%client_id, "jumphost relay ended");
}

/// Run as the standalone relay process on a mid-hop host: register with the
/// local router as a jumphost (no PTY fd), dial the real destination, and
/// shuttle packets between the two for as long as both ends stay up.
///
/// Configuration is read from the environment rather than parsed flags
/// (CLI parsing is out of scope, spec.md §1): `ET_JUMPHOST_DESTINATION`
/// (`host:port`), `ET_CLIENT_ID`, `ET_CLIENT_KEY` (hex, same as `etclient`).
pub async fn run_dial() -> Result<(), Box<dyn std::error::Error>> {
    let destination: SocketAddr = std::env::var("ET_JUMPHOST_DESTINATION")?.parse()?;
    let client_id = std::env::var("ET_CLIENT_ID")?;
    let key = parse_key(&std::env::var("ET_CLIENT_KEY")?)?;
    let router_path = et_core::router::default_router_path()?;

    let router_stream = UnixStream::connect(&router_path).await?;
    let (mut router_read_half, mut router_write_half) = router_stream.into_split();

    let idpasskey = format!("{client_id}/{}/jumphost", encode_hex(&key));
    packet::write_packet(
        &mut router_write_half,
        &et_core::Packet::plaintext(et_core::header::IDPASSKEY, idpasskey.into_bytes()),
    )
    .await?;

    let jump_client = ClientConnection::connect(destination, client_id.clone(), key).await?;
    tracing::info!(%client_id, %destination, "jumphost dialed destination");
    let downstream = Arc::clone(jump_client.connection());

    let forward_down = {
        let downstream = Arc::clone(&downstream);
        tokio::spawn(async move {
            loop {
                match packet::read_packet(&mut router_read_half).await {
                    Ok(Some(packet)) => {
                        downstream.write(&packet).await;
                    }
                    Ok(None) | Err(_) => return,
                }
            }
        })
    };

    loop {
        match downstream.read().await {
            Ok(Some(packet)) => {
                if packet::write_packet(&mut router_write_half, &packet).await.is_err() {
                    break;
                }
            }
            Ok(None) => tokio::time::sleep(Duration::from_millis(200)).await,
            Err(e) => {
                tracing::warn!(error = %e, "jumphost dial: destination read failed");
                break;
            }
        }
    }

    forward_down.abort();
    Ok(())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
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
