//! Cryptographically secure random generation.
//!
//! Uses the operating system's CSPRNG for all random number generation.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead::{KEY_SIZE, NONCE_SIZE};

/// Length of generated certificate serial numbers in bytes.
pub const SERIAL_SIZE: usize = 16;

/// Generates a cryptographically secure random 256-bit key.
///
/// The key is wrapped in `Zeroizing` to ensure it is cleared from memory when dropped.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut *key);
    key
}

/// Generates a cryptographically secure random nonce for AES-GCM.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generates a random, positive, non-zero 128-bit serial number.
///
/// The high bit is cleared so the DER INTEGER needs no sign padding and the
/// value stays within the 20-octet limit of RFC 5280.
pub fn generate_serial() -> [u8; SERIAL_SIZE] {
    loop {
        let mut serial = [0u8; SERIAL_SIZE];
        OsRng.fill_bytes(&mut serial);
        serial[0] &= 0x7F;
        if serial[0] != 0 {
            return serial;
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_key_unique() {
        let key1 = generate_key();
        let key2 = generate_key();
        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_generate_nonce_unique() {
        let mut nonces = HashSet::new();
        for _ in 0..1000 {
            assert!(nonces.insert(generate_nonce()));
        }
    }

    #[test]
    fn test_generate_serial_positive() {
        for _ in 0..1000 {
            let serial = generate_serial();
            assert!(serial[0] & 0x80 == 0);
            assert!(serial[0] != 0);
        }
    }
}
