//! `UserTerminalRouter`: the local UNIX-domain-socket IPC that lets a PTY
//! owner (or a jumphost relay) register an `(id, passkey)` pair with the
//! server, plus the router path resolution rules of spec §6.
//!
//! The PTY master fd/syscalls themselves are out of scope (spec §1); what's
//! in scope is the handoff — the owner process connects, sends one
//! `IDPASSKEY` packet, and either passes its PTY master fd as `SCM_RIGHTS`
//! ancillary data over the same UNIX socket, or (jumphost) keeps the socket
//! itself open for the session loop to relay through.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::packet::{self, header};

/// What a registering process handed the router: either a real PTY master
/// fd plus the still-open registration socket (kept around so the session
/// loop can write a one-shot `TERMINAL_INIT` back to the owner process
/// before it starts reading the PTY — see `TerminalServer::runTerminal`'s
/// reverse-tunnel env var plumbing), or, for a jumphost relay, the
/// registration socket alone — there is no PTY to hand off, so the bytes
/// that would otherwise go to/from a PTY instead go to/from this socket,
/// relayed by the session loop (spec §2's jumphost supplement).
pub enum TerminalHandoff {
    Pty { fd: RawFd, stream: UnixStream },
    Jumphost(UnixStream),
}

/// Record created when a process registers with the router; consumed once,
/// when the server hands off to it (spec §3).
pub struct TerminalUserInfo {
    pub handoff: TerminalHandoff,
    pub uid: u32,
    pub gid: u32,
}

/// Resolve the router's UNIX-socket path per spec §6: root uses a fixed
/// system path, everyone else uses `$XDG_RUNTIME_DIR`, falling back to
/// `$HOME/.local/share/etserver` (created at mode 0700) if unset or
/// relative.
pub fn default_router_path() -> std::io::Result<PathBuf> {
    // SAFETY: geteuid takes no arguments and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        return Ok(PathBuf::from("/var/run/etserver.idpasskey.fifo"));
    }

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        let path = PathBuf::from(&runtime_dir);
        if path.is_absolute() {
            let dir = path.join("etserver");
            ensure_private_dir(&dir)?;
            return Ok(dir.join("etserver.idpasskey.fifo"));
        }
    }

    let home = std::env::var("HOME").map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME is not set"))?;
    let dir = PathBuf::from(home).join(".local/share/etserver");
    ensure_private_dir(&dir)?;
    Ok(dir.join("etserver.idpasskey.fifo"))
}

fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    verify_private_dir(dir)
}

/// Verify group/other lack write access and the directory is owned by us,
/// per spec §4.6 ("verified on startup").
fn verify_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;
    let metadata = std::fs::metadata(dir)?;
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, format!("{} is not private (mode {:o})", dir.display(), mode & 0o777)));
    }
    // SAFETY: geteuid takes no arguments and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if metadata.uid() != euid {
        return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, format!("{} is not owned by euid {euid}", dir.display())));
    }
    Ok(())
}

/// The router's listening socket and id→info table.
pub struct UserTerminalRouter {
    listener: UnixListener,
    info: Mutex<HashMap<String, TerminalUserInfo>>,
}

impl UserTerminalRouter {
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        Ok(Self { listener, info: Mutex::new(HashMap::new()) })
    }

    /// Accept one connection and read its single `IDPASSKEY` packet. The
    /// payload is `"{id}/{passkey}"` for a real PTY owner (which then sends
    /// its PTY master fd as `SCM_RIGHTS` ancillary data on the same stream)
    /// or `"{id}/{passkey}/jumphost"` for a jumphost relay (no fd follows;
    /// the registration socket itself is kept open and handed off instead).
    /// Returns `(client_id, passkey)` for the caller to forward to
    /// `ServerConnection::add_client_key`.
    pub async fn accept_new_connection(&self) -> Result<(String, String), SessionError> {
        let (stream, _) = self.listener.accept().await?;
        let (uid, gid) = peer_credentials(&stream)?;

        let packet = {
            let mut stream_ref = &stream;
            packet::read_packet(&mut stream_ref).await?
        }
        .ok_or_else(|| SessionError::BadFrame("router connection closed before sending IDPASSKEY".into()))?;
        if packet.header != header::IDPASSKEY {
            return Err(SessionError::BadFrame(format!("expected IDPASSKEY, got header {}", packet.header)));
        }
        let payload = String::from_utf8(packet.payload).map_err(|e| SessionError::BadFrame(format!("IDPASSKEY payload not utf8: {e}")))?;
        let mut parts = payload.splitn(3, '/');
        let id = parts.next().ok_or_else(|| SessionError::BadFrame("IDPASSKEY payload missing id".into()))?.to_string();
        let passkey = parts.next().ok_or_else(|| SessionError::BadFrame("IDPASSKEY payload missing passkey".into()))?.to_string();
        let is_jumphost = parts.next() == Some("jumphost");

        let handoff = if is_jumphost {
            TerminalHandoff::Jumphost(stream)
        } else {
            let fd = recv_fd(&stream)?;
            TerminalHandoff::Pty { fd, stream }
        };
        self.info.lock().await.insert(id.clone(), TerminalUserInfo { handoff, uid, gid });

        Ok((id, passkey))
    }

    /// Claim the registration for `client_id`. Consumes the entry — a
    /// handoff (fd or socket) is used exactly once, by the session that
    /// looks it up right after the registry gains the matching key.
    pub async fn take_info(&self, client_id: &str) -> Option<TerminalUserInfo> {
        self.info.lock().await.remove(client_id)
    }
}

fn peer_credentials(stream: &UnixStream) -> std::io::Result<(u32, u32)> {
    let cred = stream.peer_cred()?;
    Ok((cred.uid(), cred.gid()))
}

/// Receive one `RawFd` as `SCM_RIGHTS` ancillary data from `stream`.
///
/// There is no safe wrapper for fd-passing in the crates this workspace
/// already depends on, so this is the one deliberate `unsafe` boundary in
/// the crate, isolated here rather than scattered across callers.
fn recv_fd(stream: &UnixStream) -> std::io::Result<RawFd> {
    use std::os::unix::io::AsRawFd;

    let sock_fd = stream.as_raw_fd();
    let mut data_buf = [0u8; 1];
    let mut iov = libc::iovec { iov_base: data_buf.as_mut_ptr() as *mut libc::c_void, iov_len: data_buf.len() };
    let mut cmsg_buf = [0u8; 64];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: `msg` is fully initialized above, `sock_fd` is a valid
    // connected socket fd owned by `stream`, and `cmsg_buf`/`data_buf`
    // outlive the call.
    let n = unsafe { libc::recvmsg(sock_fd, &mut msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: `msg` was populated by a successful recvmsg above.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "no SCM_RIGHTS ancillary data received"));
    }
    // SAFETY: `cmsg` was checked non-null above and points into `cmsg_buf`.
    unsafe {
        if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "ancillary data is not SCM_RIGHTS"));
        }
        let fd_ptr = libc::CMSG_DATA(cmsg) as *const RawFd;
        Ok(*fd_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_dir_rejects_group_writable() {
        let dir = std::env::temp_dir().join(format!("et-router-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o770)).unwrap();
        assert!(verify_private_dir(&dir).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn private_dir_accepts_0700() {
        let dir = std::env::temp_dir().join(format!("et-router-test-ok-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
        assert!(verify_private_dir(&dir).is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }
}
