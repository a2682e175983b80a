//! The session-wide error sum.
//!
//! Mirrors the error kinds of spec §7 directly: transient I/O is retried
//! internally and should rarely escape to here, socket-dead triggers
//! reconnect (client) or marks a client as awaiting recovery (server), and
//! the rest are fatal for the session.

use std::fmt;
use std::io;

/// Errors that can surface from any read/write path in this crate.
#[derive(Debug)]
pub enum SessionError {
    /// EAGAIN/EWOULDBLOCK/EINTR — exhausted the local retry budget.
    TransientIo(io::Error),
    /// ECONNRESET, EPIPE, ETIMEDOUT, EHOSTUNREACH, EBADF, or a clean EOF
    /// mid-frame.
    SocketDead(io::Error),
    /// Length prefix out of range, or a control-proto parse failure.
    BadFrame(String),
    /// Authenticated decrypt rejected a ciphertext.
    CryptoFailure,
    /// The peer needs bytes that have already been evicted from our replay
    /// buffer.
    UnrecoverableReplay,
    /// `ConnectResponse.status == MISMATCHED_PROTOCOL`.
    ProtocolMismatch(String),
    /// `ConnectResponse.status == INVALID_KEY`.
    InvalidKey,
    /// A port-forward dial or bind failed.
    PortForwardFailure(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientIo(e) => write!(f, "transient I/O error: {e}"),
            Self::SocketDead(e) => write!(f, "socket dead: {e}"),
            Self::BadFrame(msg) => write!(f, "bad frame: {msg}"),
            Self::CryptoFailure => write!(f, "authenticated decrypt failed"),
            Self::UnrecoverableReplay => write!(f, "peer is too far behind to recover"),
            Self::ProtocolMismatch(msg) => write!(f, "protocol mismatch: {msg}"),
            Self::InvalidKey => write!(f, "server rejected client id/key"),
            Self::PortForwardFailure(e) => write!(f, "port forward failure: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            WouldBlock | Interrupted => Self::TransientIo(e),
            TimedOut | ConnectionReset | BrokenPipe | NotConnected | UnexpectedEof => Self::SocketDead(e),
            _ => match e.raw_os_error() {
                // EHOSTUNREACH, EBADF don't have stable ErrorKind variants
                // across platforms; fall back to the socket-dead bucket for
                // anything that isn't obviously transient.
                Some(_) => Self::SocketDead(e),
                None => Self::SocketDead(e),
            },
        }
    }
}

impl From<et_crypto::AuthenticationFailed> for SessionError {
    fn from(_: et_crypto::AuthenticationFailed) -> Self {
        Self::CryptoFailure
    }
}
