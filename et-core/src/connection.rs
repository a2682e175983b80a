//! `Connection`, `ClientConnection`, `ServerConnection`, `ServerClientConnection`:
//! the bidirectional session, its reconnect loop, and the server's per-client
//! registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::backed::{BackedReader, BackedWriter, WriteResult};
use crate::error::SessionError;
use crate::packet::{self, Packet};
use crate::proto;

/// Protocol version exchanged in `ConnectRequest`. A mismatch is fatal for
/// the connecting client (spec §6).
pub const PROTOCOL_VERSION: i32 = 6;

/// One direction's `CryptoHandler` pair for a freshly agreed session key,
/// keyed by role so callers don't have to remember which MSB goes where.
fn handler_pair(key: [u8; 32], is_client: bool) -> (et_crypto::CryptoHandler, et_crypto::CryptoHandler) {
    // A client's reader decrypts what the server encrypts (SERVER_CLIENT),
    // and its writer encrypts what the server will decrypt (CLIENT_SERVER).
    // The server is the exact mirror image. Grounded on
    // ClientConnection.cpp / ServerClientConnection.cpp's constructors.
    if is_client {
        (
            et_crypto::CryptoHandler::new(key, et_crypto::SERVER_CLIENT_NONCE_MSB),
            et_crypto::CryptoHandler::new(key, et_crypto::CLIENT_SERVER_NONCE_MSB),
        )
    } else {
        (
            et_crypto::CryptoHandler::new(key, et_crypto::CLIENT_SERVER_NONCE_MSB),
            et_crypto::CryptoHandler::new(key, et_crypto::SERVER_CLIENT_NONCE_MSB),
        )
    }
}

/// A live bidirectional session: a reader half and a writer half, each
/// behind its own lock so reads never block behind a write and vice versa.
pub struct Connection {
    reader: Mutex<BackedReader>,
    writer: Mutex<BackedWriter>,
    shutting_down: AtomicBool,
}

impl Connection {
    fn new(reader: BackedReader, writer: BackedWriter) -> Self {
        Self { reader: Mutex::new(reader), writer: Mutex::new(writer), shutting_down: AtomicBool::new(false) }
    }

    /// Build a fresh `Connection` for a brand-new client id (the
    /// `NEW_CLIENT` path of the initial connect exchange).
    pub fn fresh(stream: TcpStream, key: [u8; 32], is_client: bool) -> Self {
        let (read_handler, write_handler) = handler_pair(key, is_client);
        let (read_half, write_half) = stream.into_split();
        Self::new(BackedReader::new(read_handler, read_half), BackedWriter::new(write_handler, write_half))
    }

    /// Serialize `packet`, encrypt the whole blob, frame, and push to the
    /// socket. Mirrors `Connection::write` wrapping `BackedWriter::write` in
    /// the original implementation — the thing that gets encrypted is the
    /// packet's own `{encrypted, header}` prefix plus payload, not just the
    /// payload.
    pub async fn write(&self, packet: &Packet) -> WriteResult {
        let blob = packet.serialize();
        self.writer.lock().await.write(&blob).await
    }

    /// Read, decrypt, and parse the next packet. `Ok(None)` means the
    /// socket is currently invalid (between DEAD and a successful recovery).
    pub async fn read(&self) -> Result<Option<Packet>, SessionError> {
        let mut reader = self.reader.lock().await;
        match reader.read().await? {
            Some(blob) => Packet::parse(&blob).map(Some),
            None => Ok(None),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Idempotent: mark the session as shutting down. Does not by itself
    /// close the socket — callers drop their `TcpStream`/`Connection` to do
    /// that.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Run the recovery handshake on `new_stream` against this connection's
    /// existing `BackedReader`/`BackedWriter`. Holds the writer lock for the
    /// whole handshake so concurrent `write()` callers block until revive
    /// completes (spec §4.4/§5).
    ///
    /// On any handshake failure the new stream is dropped and an error is
    /// returned; the connection's prior state (still invalid) is untouched,
    /// so the caller's reconnect loop simply tries again.
    pub async fn recover(&self, new_stream: TcpStream) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;

        let (mut read_half, mut write_half) = new_stream.into_split();

        let our_seq = reader.sequence_number();
        packet::write_packet(
            &mut write_half,
            &Packet::plaintext(0, proto::SequenceHeader { sequence_number: our_seq }.encode_to_vec()),
        )
        .await?;

        let peer_header = read_sequence_header(&mut read_half).await?;

        let to_replay = writer.recover(peer_header.sequence_number)?;
        packet::write_packet(
            &mut write_half,
            &Packet::plaintext(0, proto::CatchupBuffer { buffer: to_replay }.encode_to_vec()),
        )
        .await?;

        let peer_catchup = read_catchup_buffer(&mut read_half).await?;

        writer.revive(write_half);
        reader.revive(read_half, peer_catchup.buffer);

        Ok(())
    }
}

async fn read_sequence_header(stream: &mut tokio::net::tcp::OwnedReadHalf) -> Result<proto::SequenceHeader, SessionError> {
    let packet = packet::read_packet(stream)
        .await?
        .ok_or_else(|| SessionError::BadFrame("expected SequenceHeader, got empty frame".into()))?;
    proto::SequenceHeader::decode(packet.payload.as_slice())
        .map_err(|e| SessionError::BadFrame(format!("SequenceHeader: {e}")))
}

async fn read_catchup_buffer(stream: &mut tokio::net::tcp::OwnedReadHalf) -> Result<proto::CatchupBuffer, SessionError> {
    let packet = packet::read_packet(stream)
        .await?
        .ok_or_else(|| SessionError::BadFrame("expected CatchupBuffer, got empty frame".into()))?;
    proto::CatchupBuffer::decode(packet.payload.as_slice())
        .map_err(|e| SessionError::BadFrame(format!("CatchupBuffer: {e}")))
}

/// Client-side connection state, per the diagram in spec §4.4.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    Init,
    Alive,
    Dead,
    Recovering,
    Shutdown,
}

/// The client's view of a session: a `Connection` plus the reconnect worker
/// that keeps it alive across socket death.
pub struct ClientConnection {
    connection: Arc<Connection>,
    endpoint: std::net::SocketAddr,
    client_id: String,
    key: [u8; 32],
    state: Arc<Mutex<ClientState>>,
}

impl ClientConnection {
    /// Dial `endpoint`, perform the initial `ConnectRequest`/`ConnectResponse`
    /// exchange, and build a fresh session on `NEW_CLIENT`/`RETURNING_CLIENT`.
    ///
    /// `RETURNING_CLIENT` on a first-ever connect (no prior `Connection` to
    /// recover against) is treated the same as `NEW_CLIENT` by the caller —
    /// that status only matters to a server deciding whether to recover an
    /// existing registry entry.
    pub async fn connect(endpoint: std::net::SocketAddr, client_id: String, key: [u8; 32]) -> Result<Self, SessionError> {
        let mut stream = TcpStream::connect(endpoint).await?;
        let status = exchange_connect_request(&mut stream, &client_id).await?;
        match status {
            proto::ConnectStatus::NewClient | proto::ConnectStatus::ReturningClient => {
                let connection = Connection::fresh(stream, key, true);
                Ok(Self {
                    connection: Arc::new(connection),
                    endpoint,
                    client_id,
                    key,
                    state: Arc::new(Mutex::new(ClientState::Alive)),
                })
            }
            proto::ConnectStatus::InvalidKey => Err(SessionError::InvalidKey),
            proto::ConnectStatus::MismatchedProtocol => {
                Err(SessionError::ProtocolMismatch(format!("server runs a different protocol version than {PROTOCOL_VERSION}")))
            }
            proto::ConnectStatus::Unspecified => {
                Err(SessionError::BadFrame("server returned no ConnectStatus".into()))
            }
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub async fn state(&self) -> ClientState {
        *self.state.lock().await
    }

    /// Call after a `write`/`read` observes the socket has died: transitions
    /// to `Dead` and spawns the single reconnect worker for this
    /// transition, per spec §4.4 ("On entering DEAD, the client spawns a
    /// single reconnect worker").
    pub fn spawn_reconnect_worker(&self) {
        let connection = Arc::clone(&self.connection);
        let state = Arc::clone(&self.state);
        let endpoint = self.endpoint;
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            *state.lock().await = ClientState::Dead;
            loop {
                if connection.is_shutting_down() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Ok(mut stream) = TcpStream::connect(endpoint).await else {
                    continue;
                };
                match exchange_connect_request(&mut stream, &client_id).await {
                    Ok(proto::ConnectStatus::ReturningClient) => {
                        *state.lock().await = ClientState::Recovering;
                        match connection.recover(stream).await {
                            Ok(()) => {
                                *state.lock().await = ClientState::Alive;
                                return;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "recovery handshake failed, will retry");
                                *state.lock().await = ClientState::Dead;
                            }
                        }
                    }
                    Ok(proto::ConnectStatus::InvalidKey) => {
                        tracing::error!("server rejected client id/key on reconnect, shutting down");
                        *state.lock().await = ClientState::Shutdown;
                        connection.shutdown();
                        return;
                    }
                    Ok(_) => {
                        tracing::warn!("unexpected status on reconnect, retrying");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reconnect attempt failed, retrying");
                    }
                }
            }
        });
    }

    pub fn key(&self) -> [u8; 32] {
        self.key
    }
}

async fn exchange_connect_request(stream: &mut TcpStream, client_id: &str) -> Result<proto::ConnectStatus, SessionError> {
    let request = proto::ConnectRequest { version: PROTOCOL_VERSION, client_id: client_id.to_string() };
    packet::write_packet(stream, &Packet::plaintext(0, request.encode_to_vec())).await?;

    let response_packet = packet::read_packet(stream)
        .await?
        .ok_or_else(|| SessionError::BadFrame("expected ConnectResponse, got empty frame".into()))?;
    let response = proto::ConnectResponse::decode(response_packet.payload.as_slice())
        .map_err(|e| SessionError::BadFrame(format!("ConnectResponse: {e}")))?;
    proto::ConnectStatus::try_from(response.status)
        .map_err(|_| SessionError::BadFrame(format!("unknown ConnectStatus {}", response.status)))
}

/// Server-side per-client registry and accept loop.
///
/// Invariant (spec §3): a key may exist in `client_keys` without a matching
/// entry in `client_connections` (pre-registration via SSH bootstrap out of
/// band) but never the reverse.
pub struct ServerConnection {
    client_keys: Mutex<HashMap<String, [u8; 32]>>,
    client_connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConnection {
    pub fn new() -> Self {
        Self { client_keys: Mutex::new(HashMap::new()), client_connections: Mutex::new(HashMap::new()) }
    }

    /// Pre-register a client id/key pair (normally populated by the
    /// `UserTerminalRouter` after the SSH bootstrap hands off an id/passkey).
    ///
    /// If `client_id` is already registered, the new key must match the
    /// existing one byte-for-byte (checked in constant time, mirroring
    /// `ServerClientConnection::verifyPasskey`) or the registration is
    /// rejected — a second `IDPASSKEY` for the same id with a different
    /// passkey is someone else trying to ride in on that id, not a
    /// legitimate re-registration.
    pub async fn add_client_key(&self, client_id: String, key: [u8; 32]) -> bool {
        let mut keys = self.client_keys.lock().await;
        if let Some(existing) = keys.get(&client_id) {
            if !et_crypto::constant_time_eq(existing, &key) {
                return false;
            }
        }
        keys.insert(client_id, key);
        true
    }

    pub async fn remove_client(&self, client_id: &str) {
        if let Some(connection) = self.client_connections.lock().await.remove(client_id) {
            connection.shutdown();
        }
        self.client_keys.lock().await.remove(client_id);
    }

    /// Handle one freshly accepted TCP connection: read its
    /// `ConnectRequest`, consult the registry, and either hand back a new
    /// `Connection` (caller is responsible for invoking the `newClient`
    /// callback and may still veto registration by dropping it) or recover
    /// an existing one in place.
    ///
    /// Never holds the registry lock across the actual socket I/O beyond
    /// the single request/response exchange (spec §5: "the ServerConnection
    /// registry lock is never held across I/O").
    pub async fn accept(&self, mut stream: TcpStream) -> Result<AcceptOutcome, SessionError> {
        let request_packet = packet::read_packet(&mut stream)
            .await?
            .ok_or_else(|| SessionError::BadFrame("expected ConnectRequest, got empty frame".into()))?;
        let request = proto::ConnectRequest::decode(request_packet.payload.as_slice())
            .map_err(|e| SessionError::BadFrame(format!("ConnectRequest: {e}")))?;

        if request.version != PROTOCOL_VERSION {
            respond(&mut stream, proto::ConnectStatus::MismatchedProtocol, format!("server runs protocol {PROTOCOL_VERSION}")).await?;
            return Ok(AcceptOutcome::Rejected);
        }

        let key = { self.client_keys.lock().await.get(&request.client_id).copied() };
        let Some(key) = key else {
            respond(&mut stream, proto::ConnectStatus::InvalidKey, String::new()).await?;
            return Ok(AcceptOutcome::Rejected);
        };

        let existing = { self.client_connections.lock().await.get(&request.client_id).cloned() };
        match existing {
            None => {
                respond(&mut stream, proto::ConnectStatus::NewClient, String::new()).await?;
                let connection = Arc::new(Connection::fresh(stream, key, false));
                self.client_connections.lock().await.insert(request.client_id.clone(), Arc::clone(&connection));
                Ok(AcceptOutcome::NewClient { client_id: request.client_id, connection })
            }
            Some(connection) => {
                respond(&mut stream, proto::ConnectStatus::ReturningClient, String::new()).await?;
                connection.recover(stream).await?;
                Ok(AcceptOutcome::Recovered { client_id: request.client_id, connection })
            }
        }
    }
}

async fn respond(stream: &mut TcpStream, status: proto::ConnectStatus, error: String) -> Result<(), SessionError> {
    let response = proto::ConnectResponse { status: status as i32, error };
    packet::write_packet(stream, &Packet::plaintext(0, response.encode_to_vec())).await
}

/// What `ServerConnection::accept` produced for one incoming TCP connection.
pub enum AcceptOutcome {
    /// Client was unknown or ran a mismatched protocol version; the socket
    /// has already been told so and closed on our end.
    Rejected,
    /// A brand-new client id registered. The caller should invoke its
    /// `newClient`-equivalent callback, which may still veto by dropping
    /// `connection` and removing the registry entry.
    NewClient { client_id: String, connection: Arc<Connection> },
    /// An existing client reconnected and the recovery handshake completed.
    Recovered { client_id: String, connection: Arc<Connection> },
}

/// `ServerClientConnection` is, in this crate, exactly the `Connection`
/// stored in `ServerConnection::client_connections` — the server has no
/// additional per-client state beyond the session itself plus whatever the
/// session event loop (in `etserver`) tracks about the PTY/port-forward
/// side. The distinct type from the original implementation collapses into
/// plain `Arc<Connection>` here; see DESIGN.md.
pub type ServerClientConnection = Connection;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_request_round_trips_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_key = [9u8; 32];
        let client_id = "abcd1234abcd1234".to_string();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let server = ServerConnection::new();
            server.add_client_key(client_id.clone(), server_key).await;
            server.accept(stream).await
        });

        let client = ClientConnection::connect(addr, "abcd1234abcd1234".to_string(), server_key).await.unwrap();
        assert_eq!(client.state().await, ClientState::Alive);

        let outcome = server_task.await.unwrap().unwrap();
        assert!(matches!(outcome, AcceptOutcome::NewClient { .. }));
    }

    #[tokio::test]
    async fn unknown_client_id_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let server = ServerConnection::new();
            server.accept(stream).await
        });

        let result = ClientConnection::connect(addr, "nope0000nope0000".to_string(), [1u8; 32]).await;
        assert!(matches!(result, Err(SessionError::InvalidKey)));
        assert!(matches!(server_task.await.unwrap().unwrap(), AcceptOutcome::Rejected));
    }

    #[tokio::test]
    async fn add_client_key_rejects_mismatched_reregistration() {
        let server = ServerConnection::new();
        assert!(server.add_client_key("dupe0000dupe0000".to_string(), [1u8; 32]).await);
        assert!(!server.add_client_key("dupe0000dupe0000".to_string(), [2u8; 32]).await);
        assert!(server.add_client_key("dupe0000dupe0000".to_string(), [1u8; 32]).await);
    }
}
