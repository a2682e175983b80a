//! Core protocol implementation of an Eternal Terminal session: wire
//! framing, the reliable-resumable encrypted channel built on top of it,
//! the client/server connection state machines, port forwarding, the
//! local terminal router, and the small bits of backpressure bookkeeping
//! the session loop needs (idle timeouts, newline rate limiting).
//!
//! This crate is transport and protocol only. The PTY itself, the local
//! console, and command-line parsing live in the `etserver`/`etclient`
//! binaries that depend on it.

pub mod backed;
pub mod connection;
pub mod error;
pub mod keepalive;
pub mod packet;
pub mod portforward;
pub mod proto;
pub mod ratelimit;
pub mod router;

pub use backed::{BackedReader, BackedWriter, WriteResult};
pub use connection::{AcceptOutcome, ClientConnection, ClientState, Connection, ServerConnection, ServerClientConnection, PROTOCOL_VERSION};
pub use error::SessionError;
pub use keepalive::{IdleTracker, CLIENT_IDLE_INTERVAL, SERVER_IDLE_TIMEOUT};
pub use packet::{header, Packet};
pub use portforward::{Endpoint, PortForwardHandler};
pub use ratelimit::NewlineRateLimiter;
pub use router::{TerminalHandoff, TerminalUserInfo, UserTerminalRouter};
