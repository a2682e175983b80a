//! The 192-bit per-direction nonce counter.

use xsalsa20poly1305::XNonce;

/// Nonce MSB for client→server traffic.
pub const CLIENT_SERVER_NONCE_MSB: u8 = 0x00;
/// Nonce MSB for server→client traffic.
pub const SERVER_CLIENT_NONCE_MSB: u8 = 0x01;

/// A 24-byte nonce that ripple-increments from byte 0 upward.
///
/// The MSB lives in the last byte and is set once at construction; the
/// increment walks from the front of the array, carrying into the next byte
/// only when the current one wraps to zero, so the MSB is touched only after
/// roughly 2^184 messages.
pub(crate) struct Nonce([u8; 24]);

impl Nonce {
    pub(crate) fn new(msb: u8) -> Self {
        let mut bytes = [0u8; 24];
        bytes[23] = msb;
        Self(bytes)
    }

    pub(crate) fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }
}

impl AsRef<XNonce> for Nonce {
    fn as_ref(&self) -> &XNonce {
        XNonce::from_slice(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_ripples_and_carries() {
        let mut n = Nonce::new(0);
        n.0[0] = 0xff;
        n.increment();
        assert_eq!(n.0[0], 0);
        assert_eq!(n.0[1], 1);
    }

    #[test]
    fn msb_survives_many_increments() {
        let mut n = Nonce::new(SERVER_CLIENT_NONCE_MSB);
        for _ in 0..10_000 {
            n.increment();
        }
        assert_eq!(n.0[23], SERVER_CLIENT_NONCE_MSB);
    }
}
