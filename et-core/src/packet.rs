//! The wire `Packet`: the only framing layer. Encryption, sequence numbers,
//! and header semantics all live inside `payload`; this module just moves
//! bytes on and off the wire.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SessionError;

/// Maximum bytes allowed in a single framed read, per spec §6. A peer that
/// sends a larger length prefix is lying or broken; reject before
/// allocating.
pub const MAX_FRAME_BYTES: u64 = 128 * 1024 * 1024;

/// Packet header byte values, stable across implementations per spec §6.
pub mod header {
    pub const KEEP_ALIVE: u8 = 0;
    pub const TERMINAL_BUFFER: u8 = 1;
    pub const TERMINAL_INFO: u8 = 2;
    pub const PORT_FORWARD_DATA: u8 = 3;
    pub const PORT_FORWARD_DESTINATION_REQUEST: u8 = 4;
    pub const PORT_FORWARD_DESTINATION_RESPONSE: u8 = 5;
    pub const IDPASSKEY: u8 = 6;
    pub const INITIAL_PAYLOAD: u8 = 7;
    pub const INITIAL_RESPONSE: u8 = 8;
    pub const JUMPHOST_INIT: u8 = 9;
    pub const TERMINAL_INIT: u8 = 10;
}

/// A single framed unit on an Eternal Terminal wire: an `encrypted` flag, a
/// one-byte `header` identifying the payload's meaning, and the opaque
/// `payload` bytes themselves (ciphertext once `encrypted` is true).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub encrypted: bool,
    pub header: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Construct a fresh, not-yet-encrypted packet.
    pub fn plaintext(header: u8, payload: Vec<u8>) -> Self {
        Self { encrypted: false, header, payload }
    }

    /// Replace `payload` with its ciphertext, producing an `encrypted` packet.
    ///
    /// Double-encrypting is a programmer error: the caller already committed
    /// this exact ciphertext to a replay buffer once, and encrypting again
    /// would desynchronize the nonce from what was actually sent.
    pub fn encrypt(self, handler: &mut et_crypto::CryptoHandler) -> Self {
        assert!(!self.encrypted, "Packet::encrypt called on an already-encrypted packet");
        Self { encrypted: true, header: self.header, payload: handler.encrypt(&self.payload) }
    }

    /// Replace `payload` with its plaintext, producing a non-`encrypted` packet.
    pub fn decrypt(self, handler: &mut et_crypto::CryptoHandler) -> Result<Self, SessionError> {
        assert!(self.encrypted, "Packet::decrypt called on an already-plaintext packet");
        let payload = handler.decrypt(&self.payload)?;
        Ok(Self { encrypted: false, header: self.header, payload })
    }

    /// `[encrypted:1][header:1][payload:N]`. No length prefix — see
    /// [`write_packet`] for the framing layer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(self.encrypted as u8);
        out.push(self.header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Inverse of [`Packet::serialize`].
    pub fn parse(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() < 2 {
            return Err(SessionError::BadFrame(format!("frame too short to hold a header: {} bytes", bytes.len())));
        }
        Ok(Self { encrypted: bytes[0] != 0, header: bytes[1], payload: bytes[2..].to_vec() })
    }
}

/// Read one length-prefixed frame and parse it into a [`Packet`].
///
/// Returns `Ok(None)` for a zero-length frame ("no packet", socket remains
/// usable). A length prefix outside `0..=MAX_FRAME_BYTES`, or the socket
/// closing mid-frame, is a [`SessionError::BadFrame`]/[`SessionError::SocketDead`].
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Packet>, SessionError> {
    let mut len_buf = [0u8; 8];
    if let Err(e) = r.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(SessionError::SocketDead(e));
        }
        return Err(e.into());
    }
    let length = u64::from_be_bytes(len_buf);
    if length > MAX_FRAME_BYTES {
        return Err(SessionError::BadFrame(format!("length prefix {length} exceeds {MAX_FRAME_BYTES} byte cap")));
    }
    if length == 0 {
        return Ok(None);
    }
    let mut body = vec![0u8; length as usize];
    r.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SessionError::SocketDead(e)
        } else {
            e.into()
        }
    })?;
    Packet::parse(&body).map(Some)
}

/// Write one [`Packet`] as a length-prefixed frame: `len = payload.len() + 2`.
pub async fn write_packet<W: AsyncWrite + Unpin>(w: &mut W, packet: &Packet) -> Result<(), SessionError> {
    let body = packet.serialize();
    let length = body.len() as u64;
    w.write_all(&length.to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn serialize_parse_round_trip() {
        let p = Packet::plaintext(header::TERMINAL_BUFFER, b"hello".to_vec());
        let bytes = p.serialize();
        assert_eq!(bytes, vec![0, header::TERMINAL_BUFFER, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(Packet::parse(&bytes).unwrap(), p);
    }

    #[test]
    fn parse_rejects_short_buffers() {
        assert!(Packet::parse(&[0u8]).is_err());
        assert!(Packet::parse(&[]).is_err());
    }

    #[tokio::test]
    async fn read_packet_returns_none_for_zero_length() {
        let mut cursor = Cursor::new(0u64.to_be_bytes().to_vec());
        assert!(read_packet(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_packet_rejects_oversize_length() {
        let mut cursor = Cursor::new((MAX_FRAME_BYTES + 1).to_be_bytes().to_vec());
        assert!(matches!(read_packet(&mut cursor).await, Err(SessionError::BadFrame(_))));
    }

    #[tokio::test]
    async fn write_then_read_round_trips_over_a_buffer() {
        let p = Packet::plaintext(header::KEEP_ALIVE, vec![]);
        let mut buf = Vec::new();
        write_packet(&mut buf, &p).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let read_back = read_packet(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read_back, p);
    }

    #[tokio::test]
    async fn read_packet_maps_truncated_stream_to_socket_dead() {
        // length prefix claims 10 bytes of body, but only 2 are present.
        let mut buf = 10u64.to_be_bytes().to_vec();
        buf.extend_from_slice(&[1, 2]);
        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_packet(&mut cursor).await, Err(SessionError::SocketDead(_))));
    }

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let key = [5u8; 32];
        let mut enc_handler = et_crypto::CryptoHandler::new(key, et_crypto::CLIENT_SERVER_NONCE_MSB);
        let mut dec_handler = et_crypto::CryptoHandler::new(key, et_crypto::CLIENT_SERVER_NONCE_MSB);
        let p = Packet::plaintext(header::TERMINAL_BUFFER, b"secret keystrokes".to_vec());
        let encrypted = p.clone().encrypt(&mut enc_handler);
        assert!(encrypted.encrypted);
        let decrypted = encrypted.decrypt(&mut dec_handler).unwrap();
        assert_eq!(decrypted, p);
    }

    #[test]
    #[should_panic(expected = "already-encrypted")]
    fn double_encrypt_panics() {
        let mut handler = et_crypto::CryptoHandler::new([1u8; 32], et_crypto::CLIENT_SERVER_NONCE_MSB);
        let p = Packet::plaintext(header::KEEP_ALIVE, vec![]).encrypt(&mut handler);
        let _ = p.encrypt(&mut handler);
    }
}
