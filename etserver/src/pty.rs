//! Blocking read/write glue around the PTY master fd handed off by
//! `UserTerminalRouter`. PTY allocation itself is out of scope; this module
//! only bridges an already-open fd into the async session loop.

use std::os::unix::io::RawFd;

use et_core::NewlineRateLimiter;
use tokio::sync::mpsc;
use tokio::task;

const READ_CHUNK_BYTES: usize = 4096;

/// Spawn a blocking-thread read loop over `fd`, pushing chunks onto a
/// channel the session loop selects on. Ends the channel (`None` read by
/// the receiver) on EOF.
///
/// The newline-rate cap (spec §4.6) is enforced here, before each `read`
/// call, rather than by dropping a chunk after reading it: once over budget
/// this thread simply sleeps until the next window instead of calling
/// `read`, leaving the excess output sitting in the PTY's own buffer.
pub fn spawn_reader(fd: RawFd) -> mpsc::UnboundedReceiver<std::io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    task::spawn_blocking(move || {
        let mut limiter = NewlineRateLimiter::new();
        loop {
            while !limiter.should_read() {
                std::thread::sleep(limiter.time_until_next_window());
            }

            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            // SAFETY: `fd` is a valid, open PTY master fd for the lifetime of
            // this session (owned by the registering process, not by us), and
            // `buf` is sized to `buf.len()` for the call.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                let _ = tx.send(Err(std::io::Error::last_os_error()));
                return;
            }
            if n == 0 {
                return;
            }
            buf.truncate(n as usize);
            limiter.record(&buf);
            if tx.send(Ok(buf)).is_err() {
                return;
            }
        }
    });
    rx
}

/// Write `buf` fully to `fd`, blocking the calling thread. Used for the
/// comparatively small, infrequent writes coming off the wire, so this runs
/// directly rather than via `spawn_blocking`.
pub fn write_all(fd: RawFd, buf: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        // SAFETY: `fd` is valid for the session's lifetime; the pointer and
        // length are derived from `buf` and stay in bounds as `written`
        // advances.
        let n = unsafe { libc::write(fd, buf[written..].as_ptr() as *const libc::c_void, buf.len() - written) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        written += n as usize;
    }
    Ok(())
}

/// `TIOCSWINSZ`: apply a window-size change reported in a `TerminalInfo`.
pub fn set_window_size(fd: RawFd, rows: u16, cols: u16, width: u16, height: u16) -> std::io::Result<()> {
    let ws = libc::winsize { ws_row: rows, ws_col: cols, ws_xpixel: width, ws_ypixel: height };
    // SAFETY: `fd` is a valid PTY master fd and `ws` is a fully initialized
    // `winsize` living on this stack frame for the duration of the call.
    let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
