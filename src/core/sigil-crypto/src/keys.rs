//! The process-wide wrapping key.
//!
//! The wrapping key is provisioned at startup and protects every private key
//! Sigil persists. It implements `ZeroizeOnDrop` and never prints its bytes.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;
use crate::kdf::{derive_encryption_key, derive_key};
use crate::random::generate_key;

const ENVELOPE_CONTEXT: &[u8] = b"sigil/envelope/v1";
const KEY_ID_CONTEXT: &[u8] = b"sigil/key-id/v1";

/// A 256-bit key-encryption key with automatic zeroization.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    /// Generates a new random wrapping key.
    pub fn generate() -> Self {
        let key = generate_key();
        Self { bytes: *key }
    }

    /// Creates a wrapping key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);

        Ok(Self { bytes: key_bytes })
    }

    /// Returns the raw key bytes.
    ///
    /// Use with caution - the returned slice is not zeroized automatically.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Derives the AES-256-GCM key used for envelope encryption.
    pub fn envelope_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        derive_encryption_key(&self.bytes, ENVELOPE_CONTEXT)
    }

    /// Returns a short public identifier for this key.
    ///
    /// Stored next to every wrapped key so rotation can tell which records
    /// still need re-wrapping. Derived through HKDF, so it reveals nothing
    /// about the key itself.
    pub fn key_id(&self) -> Result<String, CryptoError> {
        let id = derive_key(&self.bytes, None, KEY_ID_CONTEXT, 8)?;
        Ok(hex::encode(&*id))
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
