//! `CryptoHandler`: per-direction nonce discipline over an authenticated
//! secretbox cipher.
//!
//! Each session has two handlers, one per direction, constructed from the
//! same 32-byte key but different nonce MSBs so the two directions never
//! share a nonce value. The nonce is ripple-incremented *before* every
//! encrypt and decrypt, so both sides consume nonce `1` for the first
//! message, `2` for the second, and so on.

#![deny(unsafe_code)]

mod nonce;

pub use nonce::{CLIENT_SERVER_NONCE_MSB, SERVER_CLIENT_NONCE_MSB};

use nonce::Nonce;
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Key, XSalsa20Poly1305};

/// Errors from [`CryptoHandler::decrypt`].
///
/// Per the session contract, a decrypt failure here is always fatal for the
/// whole session: either the nonces have desynchronized or the key is wrong,
/// and there is no way to recover a shared stream position from that state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthenticationFailed;

impl std::fmt::Display for AuthenticationFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "secretbox authentication failed")
    }
}
impl std::error::Error for AuthenticationFailed {}

/// One direction of a session's encrypted stream.
///
/// Not `Clone`/`Copy`: a handler's nonce is mutable state that must advance
/// exactly once per encrypt/decrypt call, and two concurrent encrypts would
/// produce a nonce collision. Callers share a handler behind a mutex rather
/// than cloning it.
pub struct CryptoHandler {
    cipher: XSalsa20Poly1305,
    nonce: Nonce,
}

impl CryptoHandler {
    /// Construct a handler for one direction of a session.
    ///
    /// `nonce_msb` should be [`CLIENT_SERVER_NONCE_MSB`] or
    /// [`SERVER_CLIENT_NONCE_MSB`]; the nonce starts at all-zero bytes with
    /// that value in its most significant byte.
    pub fn new(key: [u8; 32], nonce_msb: u8) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(&key)),
            nonce: Nonce::new(nonce_msb),
        }
    }

    /// Ripple-increment the nonce, then authenticated-encrypt `plaintext`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        self.nonce.increment();
        self.cipher
            .encrypt(self.nonce.as_ref(), plaintext)
            .expect("secretbox encryption is infallible for in-memory buffers")
    }

    /// Ripple-increment the nonce, then authenticated-decrypt `ciphertext`.
    ///
    /// Failure means the ciphertext was tampered with, truncated, or the
    /// nonce has already diverged from the peer's — the caller must treat
    /// this as a fatal, session-ending error (see [`AuthenticationFailed`]).
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthenticationFailed> {
        self.nonce.increment();
        self.cipher
            .decrypt(self.nonce.as_ref(), ciphertext)
            .map_err(|_| AuthenticationFailed)
    }
}

/// Constant-time comparison of two equal-length byte strings.
///
/// Loops the full common length regardless of where the first mismatch
/// occurs, ORing mismatches into a single accumulator, so the number of
/// iterations never leaks which byte differed.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_message() {
        let key = [7u8; 32];
        let mut enc = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        let mut dec = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        let ct = enc.encrypt(b"hello eternal terminal");
        let pt = dec.decrypt(&ct).unwrap();
        assert_eq!(pt, b"hello eternal terminal");
    }

    #[test]
    fn directions_never_share_a_nonce() {
        let key = [3u8; 32];
        let mut cs = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        let mut sc = CryptoHandler::new(key, SERVER_CLIENT_NONCE_MSB);
        let a = cs.encrypt(b"a");
        let b = sc.encrypt(b"a");
        assert_ne!(a, b);
    }

    #[test]
    fn sequential_messages_use_sequential_nonces() {
        let key = [1u8; 32];
        let mut enc = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        let mut dec = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        for i in 0..8u8 {
            let ct = enc.encrypt(&[i]);
            assert_eq!(dec.decrypt(&ct).unwrap(), vec![i]);
        }
    }

    #[test]
    fn bit_flip_is_rejected() {
        let key = [9u8; 32];
        let mut enc = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        let mut dec = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        let mut ct = enc.encrypt(b"integrity");
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(dec.decrypt(&ct).is_err());
    }

    #[test]
    fn decrypt_out_of_order_fails() {
        let key = [2u8; 32];
        let mut enc = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        let mut dec = CryptoHandler::new(key, CLIENT_SERVER_NONCE_MSB);
        let first = enc.encrypt(b"one");
        let second = enc.encrypt(b"two");
        // decrypt consumes nonce 1 for `second`, but `second` was encrypted
        // under nonce 2 — the streams have desynchronized.
        assert!(dec.decrypt(&second).is_err());
        let _ = first;
    }

    #[test]
    fn constant_time_eq_matches_and_rejects() {
        assert!(constant_time_eq(b"passkey1234567890123456789012ab", b"passkey1234567890123456789012ab"));
        assert!(!constant_time_eq(b"passkey1234567890123456789012ab", b"passkey1234567890123456789012XX"));
        assert!(!constant_time_eq(b"short", b"shorter"));
    }
}
