//! `PortForwardHandler`: multiplexes arbitrarily many local TCP/UNIX sockets
//! over the one encrypted session using `socket_id: i32`.
//!
//! Source and destination halves each own a map keyed by socket-id (spec
//! §3's "every open forwarded stream has exactly one entry in exactly one
//! side's map"). Per-socket reads are driven by a spawned task per
//! connection that forwards bytes into `PORT_FORWARD_DATA` packets pushed
//! onto a shared outbound channel — the `tokio`-idiomatic equivalent of the
//! original's `update()` poll loop (see SPEC_FULL.md §1's runtime
//! substitution note).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use prost::Message as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};

use crate::error::SessionError;
use crate::packet::{header, Packet};
use crate::proto;

const READ_CHUNK_BYTES: usize = 1024;

/// Either side of a forward: a loopback TCP port or a filesystem UNIX path.
#[derive(Clone, Debug)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// Generate a fresh, unpredictable UNIX socket path for an environment-variable
/// forward (spec §4.5's "Environment-variable forwards": the source binds a
/// UNIX socket at a freshly generated path and reports it back so the peer
/// can export an env var pointing at it — handy for forwarding an ssh-agent
/// socket). The path lives under the system temp dir; callers are
/// responsible for exporting it under the caller-supplied env var name.
pub fn generate_env_socket_path() -> PathBuf {
    let mut suffix = [0u8; 8];
    getrandom::getrandom(&mut suffix).expect("system randomness source is available");
    let mut hex = String::with_capacity(suffix.len() * 2);
    for b in suffix {
        hex.push_str(&format!("{b:02x}"));
    }
    std::env::temp_dir().join(format!("et-fwd-{hex}.sock"))
}

/// A local, already-connected half of a forwarded stream. Read and write
/// halves are split so the read side can live in its own forwarding task
/// while the write side sits in a handler-owned map.
enum StreamWriteHalf {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Unix(tokio::net::unix::OwnedWriteHalf),
}

impl StreamWriteHalf {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(w) => w.write_all(buf).await,
            Self::Unix(w) => w.write_all(buf).await,
        }
    }
    async fn shutdown(&mut self) {
        let _ = match self {
            Self::Tcp(w) => w.shutdown().await,
            Self::Unix(w) => w.shutdown().await,
        };
    }
}

enum StreamReadHalf {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    Unix(tokio::net::unix::OwnedReadHalf),
}

impl StreamReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(r) => r.read(buf).await,
            Self::Unix(r) => r.read(buf).await,
        }
    }
}

fn split_tcp(stream: TcpStream) -> (StreamReadHalf, StreamWriteHalf) {
    let (r, w) = stream.into_split();
    (StreamReadHalf::Tcp(r), StreamWriteHalf::Tcp(w))
}

fn split_unix(stream: UnixStream) -> (StreamReadHalf, StreamWriteHalf) {
    let (r, w) = stream.into_split();
    (StreamReadHalf::Unix(r), StreamWriteHalf::Unix(w))
}

/// A source listener accepted a connection but the peer hasn't yet told us
/// which `socket_id` it corresponds to.
struct PendingSource {
    read: StreamReadHalf,
    write: StreamWriteHalf,
}

struct SourceListenerState {
    dest: proto::PortForwardDestinationRequest,
}

/// Multiplexes local sockets over the session's single ordered packet
/// stream.
pub struct PortForwardHandler {
    outbound: mpsc::UnboundedSender<Packet>,
    next_socket_id: AtomicI32,
    /// Accepted-but-unassigned source connections, FIFO per the single
    /// ordered request/response exchange (spec §4.5: requests and their
    /// responses are matched in the order they cross the wire).
    pending_sources: Mutex<VecDeque<PendingSource>>,
    /// `socket_id -> write half` for connections owned by the source side.
    source_writers: Mutex<HashMap<i32, StreamWriteHalf>>,
    /// `socket_id -> write half` for connections owned by the destination side.
    destination_writers: Mutex<HashMap<i32, StreamWriteHalf>>,
    listeners: Mutex<Vec<SourceListenerState>>,
}

impl PortForwardHandler {
    pub fn new(outbound: mpsc::UnboundedSender<Packet>) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            next_socket_id: AtomicI32::new(0),
            pending_sources: Mutex::new(VecDeque::new()),
            source_writers: Mutex::new(HashMap::new()),
            destination_writers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Bind and listen on `source`, announcing each new connection to the
    /// peer as a destination request for `dest`. Returns immediately; the
    /// accept loop runs in a spawned task for the lifetime of the handler.
    pub async fn create_source(self: &Arc<Self>, source: Endpoint, dest: proto::PortForwardDestinationRequest) -> Result<(), SessionError> {
        self.listeners.lock().await.push(SourceListenerState { dest: dest.clone() });
        let this = Arc::clone(self);
        match source {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(SessionError::PortForwardFailure)?;
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => this.clone().on_source_accept(split_tcp(stream), dest.clone()).await,
                            Err(e) => {
                                tracing::warn!(error = %e, "source accept failed");
                                break;
                            }
                        }
                    }
                });
            }
            Endpoint::Unix(path) => {
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path).map_err(SessionError::PortForwardFailure)?;
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => this.clone().on_source_accept(split_unix(stream), dest.clone()).await,
                            Err(e) => {
                                tracing::warn!(error = %e, "source accept failed");
                                break;
                            }
                        }
                    }
                });
            }
        }
        Ok(())
    }

    async fn on_source_accept(self: Arc<Self>, (read, write): (StreamReadHalf, StreamWriteHalf), dest: proto::PortForwardDestinationRequest) {
        self.pending_sources.lock().await.push_back(PendingSource { read, write });
        let payload = dest.encode_to_vec();
        let _ = self.outbound.send(Packet::plaintext(header::PORT_FORWARD_DESTINATION_REQUEST, payload));
    }

    /// Create a destination-side dialer entry: called once per
    /// `PORT_FORWARD_DESTINATION_REQUEST` received from the peer.
    async fn create_destination(self: &Arc<Self>, request: &proto::PortForwardDestinationRequest) -> Packet {
        let dial_result = if !request.name.is_empty() {
            TcpStream::connect((request.name.as_str(), request.port as u16)).await.map(split_tcp)
        } else {
            TcpStream::connect(("127.0.0.1", request.port as u16)).await.map(split_tcp)
        };

        match dial_result {
            Ok((read, write)) => {
                let socket_id = self.next_socket_id.fetch_add(1, Ordering::SeqCst);
                self.destination_writers.lock().await.insert(socket_id, write);
                self.spawn_reader(socket_id, read, false);
                let response = proto::PortForwardDestinationResponse { socket_id, error: String::new() };
                Packet::plaintext(header::PORT_FORWARD_DESTINATION_RESPONSE, response.encode_to_vec())
            }
            Err(e) => {
                let response = proto::PortForwardDestinationResponse { socket_id: -1, error: e.to_string() };
                Packet::plaintext(header::PORT_FORWARD_DESTINATION_RESPONSE, response.encode_to_vec())
            }
        }
    }

    /// Spawn the per-connection read loop: non-blocking-equivalent chunked
    /// reads, packaged as `PORT_FORWARD_DATA` and pushed to `outbound`.
    /// `source_to_destination` records which side originated the read so
    /// the peer dispatches it correctly.
    fn spawn_reader(self: &Arc<Self>, socket_id: i32, mut read: StreamReadHalf, source_to_destination: bool) {
        let outbound = self.outbound.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match read.read(&mut buf).await {
                    Ok(0) => {
                        let data = proto::PortForwardData { socket_id, source_to_destination, buffer: Vec::new(), closed: true, error: String::new() };
                        let _ = outbound.send(Packet::plaintext(header::PORT_FORWARD_DATA, data.encode_to_vec()));
                        this.remove_mapping(socket_id, source_to_destination).await;
                        return;
                    }
                    Ok(n) => {
                        let data = proto::PortForwardData {
                            socket_id,
                            source_to_destination,
                            buffer: buf[..n].to_vec(),
                            closed: false,
                            error: String::new(),
                        };
                        let _ = outbound.send(Packet::plaintext(header::PORT_FORWARD_DATA, data.encode_to_vec()));
                    }
                    Err(e) => {
                        let data = proto::PortForwardData { socket_id, source_to_destination, buffer: Vec::new(), closed: false, error: e.to_string() };
                        let _ = outbound.send(Packet::plaintext(header::PORT_FORWARD_DATA, data.encode_to_vec()));
                        this.remove_mapping(socket_id, source_to_destination).await;
                        return;
                    }
                }
            }
        });
    }

    async fn remove_mapping(&self, socket_id: i32, source_to_destination: bool) {
        if source_to_destination {
            self.source_writers.lock().await.remove(&socket_id);
        } else {
            self.destination_writers.lock().await.remove(&socket_id);
        }
    }

    /// Dispatch a packet whose header is one of the three
    /// `PORT_FORWARD_*` types. Callers are expected to have already
    /// filtered on header.
    pub async fn handle_packet(self: &Arc<Self>, packet: &Packet) -> Result<Option<Packet>, SessionError> {
        match packet.header {
            header::PORT_FORWARD_DESTINATION_REQUEST => {
                let request = proto::PortForwardDestinationRequest::decode(packet.payload.as_slice())
                    .map_err(|e| SessionError::BadFrame(format!("PortForwardDestinationRequest: {e}")))?;
                Ok(Some(self.create_destination(&request).await))
            }
            header::PORT_FORWARD_DESTINATION_RESPONSE => {
                let response = proto::PortForwardDestinationResponse::decode(packet.payload.as_slice())
                    .map_err(|e| SessionError::BadFrame(format!("PortForwardDestinationResponse: {e}")))?;
                let pending = self.pending_sources.lock().await.pop_front();
                let Some(mut pending) = pending else {
                    tracing::warn!("destination response with no pending source connection");
                    return Ok(None);
                };
                if !response.error.is_empty() {
                    pending.write.shutdown().await;
                    return Ok(None);
                }
                self.source_writers.lock().await.insert(response.socket_id, pending.write);
                self.spawn_reader(response.socket_id, pending.read, true);
                Ok(None)
            }
            header::PORT_FORWARD_DATA => {
                let data = proto::PortForwardData::decode(packet.payload.as_slice())
                    .map_err(|e| SessionError::BadFrame(format!("PortForwardData: {e}")))?;
                self.deliver_data(data).await;
                Ok(None)
            }
            other => Err(SessionError::BadFrame(format!("not a port-forward header: {other}"))),
        }
    }

    /// `source_to_destination == true` means the bytes travel toward the
    /// destination-side socket (so we write them to our destination-side
    /// map); `false` means the reverse.
    async fn deliver_data(&self, data: proto::PortForwardData) {
        let writers = if data.source_to_destination { &self.destination_writers } else { &self.source_writers };
        if data.closed || !data.error.is_empty() {
            if let Some(mut w) = writers.lock().await.remove(&data.socket_id) {
                w.shutdown().await;
            }
            return;
        }
        let mut writers = writers.lock().await;
        if let Some(w) = writers.get_mut(&data.socket_id) {
            if let Err(e) = w.write_all(&data.buffer).await {
                tracing::warn!(error = %e, socket_id = data.socket_id, "forwarded write failed");
                writers.remove(&data.socket_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_socket_paths_are_unique_and_under_temp_dir() {
        let a = generate_env_socket_path();
        let b = generate_env_socket_path();
        assert_ne!(a, b);
        assert!(a.starts_with(std::env::temp_dir()));
        assert_eq!(a.extension().unwrap(), "sock");
    }

    #[tokio::test]
    async fn create_destination_replies_with_error_on_dial_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = PortForwardHandler::new(tx);
        // port 0 never accepts connections; this exercises the failure path
        // without depending on a specific closed port being free.
        let request = proto::PortForwardDestinationRequest { name: String::new(), port: 0 };
        let response_packet = handler.create_destination(&request).await;
        let response = proto::PortForwardDestinationResponse::decode(response_packet.payload.as_slice()).unwrap();
        assert!(!response.error.is_empty());
    }

    #[tokio::test]
    async fn destination_response_with_no_pending_source_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = PortForwardHandler::new(tx);
        let response = proto::PortForwardDestinationResponse { socket_id: 3, error: String::new() };
        let packet = Packet::plaintext(header::PORT_FORWARD_DESTINATION_RESPONSE, response.encode_to_vec());
        assert!(handler.handle_packet(&packet).await.unwrap().is_none());
    }
}
