//! `BackedReader`/`BackedWriter`: the single-direction reliable-resumable
//! channel. Each owns a [`et_crypto::CryptoHandler`] for its direction, an
//! `i64` sequence number, and (writer side) a replay buffer of already-sent
//! ciphertexts capped at [`REPLAY_CAP_BYTES`].

use std::collections::VecDeque;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::SessionError;

/// Replay buffer cap, per spec §3/§6: 64 MiB per writer.
pub const REPLAY_CAP_BYTES: usize = 64 * 1024 * 1024;

/// Outcome of a single [`BackedWriter::write`] call.
#[derive(Debug, Eq, PartialEq)]
pub enum WriteResult {
    /// The plaintext was encrypted, buffered, and written to the socket.
    Success,
    /// The plaintext was encrypted and buffered, but the socket write failed
    /// in a way that invalidates the socket. The bytes are safe — they will
    /// be replayed on reconnect — so the caller must *not* retry this write.
    WroteWithFailure,
    /// The socket was already invalid; nothing was written. Treated as
    /// success by the caller since reconnect will replay from the buffer —
    /// but note this case never buffers, because the plaintext was never
    /// encrypted in the first place.
    Skipped,
}

/// The single-direction write half: encrypt, buffer-for-replay, then push to
/// the socket.
pub struct BackedWriter {
    handler: et_crypto::CryptoHandler,
    replay: VecDeque<Vec<u8>>,
    replay_bytes: usize,
    sequence_number: i64,
    socket: Option<OwnedWriteHalf>,
}

impl BackedWriter {
    pub fn new(handler: et_crypto::CryptoHandler, socket: OwnedWriteHalf) -> Self {
        Self { handler, replay: VecDeque::new(), replay_bytes: 0, sequence_number: 0, socket: Some(socket) }
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    fn invalidate(&mut self) {
        self.socket = None;
    }

    /// Encrypt `plaintext`, commit it to the replay buffer, then attempt to
    /// push `[len:u32 BE][ciphertext]` to the socket.
    ///
    /// Step 2 is the point of no return: once the nonce has advanced and the
    /// ciphertext sits in the replay buffer, the write is "done" from the
    /// session's point of view regardless of what the socket does next.
    pub async fn write(&mut self, plaintext: &[u8]) -> WriteResult {
        if self.socket.is_none() {
            return WriteResult::Skipped;
        }

        let ciphertext = self.handler.encrypt(plaintext);

        self.replay_bytes += ciphertext.len();
        self.replay.push_back(ciphertext.clone());
        self.sequence_number += 1;
        while self.replay_bytes > REPLAY_CAP_BYTES {
            if let Some(evicted) = self.replay.pop_front() {
                self.replay_bytes -= evicted.len();
            } else {
                break;
            }
        }

        let socket = self.socket.as_mut().expect("checked above");
        let len = ciphertext.len() as u32;
        let write_result = async {
            socket.write_all(&len.to_be_bytes()).await?;
            socket.write_all(&ciphertext).await?;
            socket.flush().await
        }
        .await;

        match write_result {
            Ok(()) => WriteResult::Success,
            Err(e) => {
                tracing::warn!(error = %e, "backed writer socket failed, invalidating");
                self.invalidate();
                WriteResult::WroteWithFailure
            }
        }
    }

    /// Compute how many of the most recently written ciphertexts the peer
    /// needs replayed, in original (chronological) order.
    ///
    /// Called only once the socket is invalidated, as part of the recovery
    /// handshake.
    pub fn recover(&self, last_valid_seq: i64) -> Result<Vec<Vec<u8>>, SessionError> {
        let n = self.sequence_number - last_valid_seq;
        if n < 0 {
            return Err(SessionError::BadFrame(format!(
                "peer claims sequence {last_valid_seq} ahead of our writer's {0}",
                self.sequence_number
            )));
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        let n = n as usize;
        if n > self.replay.len() {
            return Err(SessionError::UnrecoverableReplay);
        }
        // `replay` is oldest-first; the last `n` entries are exactly the
        // most recent `n` writes, already in chronological order.
        Ok(self.replay.iter().rev().take(n).rev().cloned().collect())
    }

    /// Install a freshly connected socket after a successful recovery
    /// handshake. The writer resumes normal operation; its sequence number
    /// and replay buffer are untouched (the peer's reader now holds the
    /// catchup bytes it needed).
    pub fn revive(&mut self, socket: OwnedWriteHalf) {
        self.socket = Some(socket);
    }
}

/// The single-direction read half: deframe, decrypt, track sequence.
pub struct BackedReader {
    handler: et_crypto::CryptoHandler,
    local_queue: VecDeque<Vec<u8>>,
    sequence_number: i64,
    partial: Vec<u8>,
    socket: Option<OwnedReadHalf>,
}

impl BackedReader {
    pub fn new(handler: et_crypto::CryptoHandler, socket: OwnedReadHalf) -> Self {
        Self { handler, local_queue: VecDeque::new(), sequence_number: 0, partial: Vec::new(), socket: Some(socket) }
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    /// Read and decrypt the next plaintext. Drains the pre-decrypt queue
    /// (filled by [`BackedReader::revive`]) before touching the socket.
    /// Returns `Ok(None)` if the socket is currently invalid.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        if let Some(ciphertext) = self.local_queue.pop_front() {
            // `revive` already advanced `sequence_number` by the whole
            // pending-ciphertexts count up front; incrementing again here
            // per drained entry would double-count every replayed frame.
            let plaintext = self.handler.decrypt(&ciphertext)?;
            return Ok(Some(plaintext));
        }

        let Some(socket) = self.socket.as_mut() else {
            return Ok(None);
        };

        if self.partial.len() < 4 {
            let mut len_buf = [0u8; 4];
            let have = self.partial.len();
            len_buf[..have].copy_from_slice(&self.partial);
            match socket.read_exact(&mut len_buf[have..]).await {
                Ok(_) => self.partial = len_buf.to_vec(),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.invalidate();
                    return Err(SessionError::SocketDead(e));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let length = u32::from_be_bytes(self.partial[..4].try_into().unwrap()) as usize;
        let mut body = vec![0u8; length];
        match socket.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.invalidate();
                return Err(SessionError::SocketDead(e));
            }
            Err(e) => return Err(e.into()),
        }

        self.partial.clear();
        let plaintext = self.handler.decrypt(&body)?;
        self.sequence_number += 1;
        Ok(Some(plaintext))
    }

    fn invalidate(&mut self) {
        self.socket = None;
    }

    /// Install a freshly connected socket and the peer's replayed
    /// ciphertexts after a successful recovery handshake.
    ///
    /// The supplied ciphertexts are pushed to the local pre-decrypt queue in
    /// order and the sequence number is advanced by their count — the old
    /// frames will be decrypted with already-advanced nonces, exactly
    /// mirroring the peer writer's nonce state at the point each was first
    /// encrypted.
    pub fn revive(&mut self, socket: OwnedReadHalf, pending_ciphertexts: Vec<Vec<u8>>) {
        self.partial.clear();
        self.sequence_number += pending_ciphertexts.len() as i64;
        self.local_queue.extend(pending_ciphertexts);
        self.socket = Some(socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_pair(key: [u8; 32]) -> (et_crypto::CryptoHandler, et_crypto::CryptoHandler) {
        (
            et_crypto::CryptoHandler::new(key, et_crypto::CLIENT_SERVER_NONCE_MSB),
            et_crypto::CryptoHandler::new(key, et_crypto::CLIENT_SERVER_NONCE_MSB),
        )
    }

    #[test]
    fn recover_rejects_negative_diff() {
        let (enc, _) = handler_pair([1u8; 32]);
        let writer = fake_writer(enc);
        assert!(writer.recover(100).is_err());
    }

    #[test]
    fn recover_returns_empty_when_caught_up() {
        let (enc, _) = handler_pair([2u8; 32]);
        let writer = fake_writer(enc);
        assert_eq!(writer.recover(0).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn recover_fails_when_buffer_too_short() {
        let (enc, _) = handler_pair([3u8; 32]);
        let mut writer = fake_writer(enc);
        writer.sequence_number = 5;
        // replay buffer is empty, but peer claims to be 5 behind.
        assert!(matches!(writer.recover(0), Err(SessionError::UnrecoverableReplay)));
    }

    #[test]
    fn recover_returns_chronological_order() {
        let (enc, _) = handler_pair([4u8; 32]);
        let mut writer = fake_writer(enc);
        for i in 0..5u8 {
            writer.replay.push_back(vec![i]);
            writer.replay_bytes += 1;
            writer.sequence_number += 1;
        }
        let recovered = writer.recover(2).unwrap();
        assert_eq!(recovered, vec![vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn eviction_respects_cap() {
        let (enc, _) = handler_pair([5u8; 32]);
        let mut writer = fake_writer(enc);
        writer.replay.push_back(vec![0u8; REPLAY_CAP_BYTES]);
        writer.replay_bytes = REPLAY_CAP_BYTES;
        writer.replay.push_back(vec![1u8; 10]);
        writer.replay_bytes += 10;
        while writer.replay_bytes > REPLAY_CAP_BYTES {
            let evicted = writer.replay.pop_front().unwrap();
            writer.replay_bytes -= evicted.len();
        }
        assert_eq!(writer.replay.len(), 1);
    }

    // Builds a BackedWriter with no real socket, for unit-testing the pure
    // recover()/eviction bookkeeping without I/O.
    fn fake_writer(handler: et_crypto::CryptoHandler) -> BackedWriter {
        BackedWriter {
            handler,
            replay: VecDeque::new(),
            replay_bytes: 0,
            sequence_number: 0,
            socket: None,
        }
    }
}
