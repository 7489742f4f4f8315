//! Envelope encryption of private keys at rest.
//!
//! Private keys cross the persistence boundary only as [`WrappedKey`]s:
//! AES-256-GCM ciphertext under a key derived from the process-wide
//! [`WrappingKey`], with a fresh random IV per call. Every record carries the
//! id of the wrapping key that produced it, so a rotation can re-wrap old
//! records while new and old keys are both loaded.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use sigil_crypto::aead::{self, Detached, NONCE_SIZE, TAG_SIZE};
use sigil_crypto::WrappingKey;

use crate::error::{PkiError, Result};
use crate::types::base64_bytes;

const WRAP_AAD: &[u8] = b"sigil/private-key";

/// A private key encrypted under a wrapping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Encrypted PKCS#8 bytes.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// 96-bit GCM nonce.
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    /// 128-bit GCM authentication tag.
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    /// Id of the wrapping key used.
    pub key_id: String,
}

#[derive(Clone)]
struct Slot {
    key_id: String,
    key: Zeroizing<[u8; aead::KEY_SIZE]>,
}

impl Slot {
    fn new(wrapping_key: &WrappingKey) -> Result<Self> {
        Ok(Self {
            key_id: wrapping_key.key_id()?,
            key: wrapping_key.envelope_key()?,
        })
    }
}

/// Wraps and unwraps private keys.
pub struct EnvelopeCipher {
    current: Slot,
    previous: Option<Slot>,
}

impl EnvelopeCipher {
    /// Creates a cipher that wraps with `wrapping_key`.
    pub fn new(wrapping_key: &WrappingKey) -> Result<Self> {
        Ok(Self {
            current: Slot::new(wrapping_key)?,
            previous: None,
        })
    }

    /// Also accepts records wrapped with `previous` while a rotation runs.
    pub fn with_previous(mut self, previous: &WrappingKey) -> Result<Self> {
        self.previous = Some(Slot::new(previous)?);
        Ok(self)
    }

    /// Switches to `next` for new records while still opening records
    /// wrapped with the current key.
    pub fn rotated(&self, next: &WrappingKey) -> Result<Self> {
        let current = Slot::new(next)?;
        let previous = if current.key_id == self.current.key_id {
            self.previous.clone()
        } else {
            Some(self.current.clone())
        };
        Ok(Self { current, previous })
    }

    /// Id of the key new records are wrapped with.
    pub fn key_id(&self) -> &str {
        &self.current.key_id
    }

    /// Encrypts `plaintext` with a fresh IV.
    pub fn wrap(&self, plaintext: &[u8]) -> Result<WrappedKey> {
        let Detached {
            nonce,
            ciphertext,
            tag,
        } = aead::encrypt_detached(&*self.current.key, plaintext, Some(WRAP_AAD))?;

        Ok(WrappedKey {
            ciphertext,
            iv: nonce.to_vec(),
            auth_tag: tag.to_vec(),
            key_id: self.current.key_id.clone(),
        })
    }

    /// Decrypts a wrapped key.
    ///
    /// Any tampering with ciphertext, IV or tag fails with
    /// [`PkiError::DecryptionFailed`]; no partial plaintext is returned.
    pub fn unwrap(&self, wrapped: &WrappedKey) -> Result<Zeroizing<Vec<u8>>> {
        let slot = self.slot_for(&wrapped.key_id)?;

        let nonce: [u8; NONCE_SIZE] = wrapped
            .iv
            .as_slice()
            .try_into()
            .map_err(|_| PkiError::DecryptionFailed(format!("IV must be {NONCE_SIZE} bytes")))?;
        let tag: [u8; TAG_SIZE] = wrapped
            .auth_tag
            .as_slice()
            .try_into()
            .map_err(|_| PkiError::DecryptionFailed(format!("tag must be {TAG_SIZE} bytes")))?;

        let parts = Detached {
            nonce,
            ciphertext: wrapped.ciphertext.clone(),
            tag,
        };

        Ok(aead::decrypt_detached(&*slot.key, &parts, Some(WRAP_AAD))?)
    }

    /// True when `wrapped` was not produced by the current key.
    pub fn needs_rewrap(&self, wrapped: &WrappedKey) -> bool {
        wrapped.key_id != self.current.key_id
    }

    /// Re-encrypts a wrapped key under the current key.
    pub fn rewrap(&self, wrapped: &WrappedKey) -> Result<WrappedKey> {
        let plaintext = self.unwrap(wrapped)?;
        self.wrap(&plaintext)
    }

    fn slot_for(&self, key_id: &str) -> Result<&Slot> {
        if key_id == self.current.key_id {
            return Ok(&self.current);
        }
        match &self.previous {
            Some(previous) if previous.key_id == key_id => Ok(previous),
            _ => Err(PkiError::DecryptionFailed(format!(
                "no wrapping key loaded for key id {key_id}"
            ))),
        }
    }
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("key_id", &self.current.key_id)
            .field("rotating", &self.previous.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(&WrappingKey::generate()).unwrap()
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let cipher = cipher();

        for len in [0usize, 1, 32, 1217] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let wrapped = cipher.wrap(&plaintext).unwrap();
            assert_eq!(*cipher.unwrap(&wrapped).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let cipher = cipher();
        let a = cipher.wrap(b"same key").unwrap();
        let b = cipher.wrap(b"same key").unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_any_bit_flip_fails() {
        let cipher = cipher();
        let wrapped = cipher.wrap(b"pkcs8 private key bytes").unwrap();

        for byte in 0..wrapped.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = wrapped.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert!(matches!(
                    cipher.unwrap(&tampered),
                    Err(PkiError::DecryptionFailed(_))
                ));
            }
        }
        for byte in 0..NONCE_SIZE {
            let mut tampered = wrapped.clone();
            tampered.iv[byte] ^= 0x01;
            assert!(matches!(
                cipher.unwrap(&tampered),
                Err(PkiError::DecryptionFailed(_))
            ));
        }
        for byte in 0..TAG_SIZE {
            let mut tampered = wrapped.clone();
            tampered.auth_tag[byte] ^= 0x80;
            assert!(matches!(
                cipher.unwrap(&tampered),
                Err(PkiError::DecryptionFailed(_))
            ));
        }
    }

    #[test]
    fn test_truncated_parts_fail() {
        let cipher = cipher();
        let mut wrapped = cipher.wrap(b"secret").unwrap();
        wrapped.auth_tag.pop();

        assert!(matches!(
            cipher.unwrap(&wrapped),
            Err(PkiError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_wrong_wrapping_key_fails() {
        let wrapped = cipher().wrap(b"secret").unwrap();
        let other = cipher();

        assert!(matches!(
            other.unwrap(&wrapped),
            Err(PkiError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_rotation_rewraps_with_new_key() {
        let old_key = WrappingKey::generate();
        let new_key = WrappingKey::generate();

        let old = EnvelopeCipher::new(&old_key).unwrap();
        let wrapped = old.wrap(b"ca private key").unwrap();

        let rotating = EnvelopeCipher::new(&new_key)
            .unwrap()
            .with_previous(&old_key)
            .unwrap();
        assert!(rotating.needs_rewrap(&wrapped));

        let rewrapped = rotating.rewrap(&wrapped).unwrap();
        assert!(!rotating.needs_rewrap(&rewrapped));
        assert_eq!(rewrapped.key_id, new_key.key_id().unwrap());

        let after = EnvelopeCipher::new(&new_key).unwrap();
        assert_eq!(&**after.unwrap(&rewrapped).unwrap(), b"ca private key");
        assert!(after.unwrap(&wrapped).is_err());
    }

    #[test]
    fn test_rotated_keeps_old_key_readable() {
        let old = cipher();
        let wrapped = old.wrap(b"leaf key").unwrap();

        let rotating = old.rotated(&WrappingKey::generate()).unwrap();
        assert_ne!(rotating.key_id(), old.key_id());
        assert_eq!(&**rotating.unwrap(&wrapped).unwrap(), b"leaf key");
        assert_eq!(rotating.wrap(b"x").unwrap().key_id, rotating.key_id());
    }

    #[test]
    fn test_serialized_form_has_no_plaintext() {
        let cipher = cipher();
        let wrapped = cipher.wrap(b"PLAINTEXT-MARKER").unwrap();
        let json = serde_json::to_string(&wrapped).unwrap();

        assert!(!json.contains("PLAINTEXT-MARKER"));
        let back: WrappedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wrapped);
    }
}
