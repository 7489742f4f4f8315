//! Key pair generation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use sigil_crypto::asymmetric::{MAX_RSA_BITS, MIN_RSA_BITS};
use sigil_crypto::{EcCurve, KeyAlgorithm, PrivateKey, PublicKey};

use crate::error::{PkiError, Result};

/// Key family requested from the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// RSA, needs a size.
    Rsa,
    /// ECDSA, needs a curve.
    Ecdsa,
    /// Ed25519, takes neither.
    Ed25519,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Rsa => write!(f, "rsa"),
            KeyKind::Ecdsa => write!(f, "ecdsa"),
            KeyKind::Ed25519 => write!(f, "ed25519"),
        }
    }
}

impl FromStr for KeyKind {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyKind::Rsa),
            "ecdsa" | "ec" => Ok(KeyKind::Ecdsa),
            "ed25519" => Ok(KeyKind::Ed25519),
            _ => Err(PkiError::InvalidKeyParameters(format!("unknown key type '{s}'"))),
        }
    }
}

/// A freshly generated key pair.
///
/// Never persisted as is: the private half is either wrapped by the
/// envelope cipher or handed to the caller once.
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Wraps an existing private key.
    pub fn from_private(private: PrivateKey) -> Result<Self> {
        let public = private.public_key()?;
        Ok(Self { private, public })
    }

    /// Key algorithm.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.private.algorithm()
    }

    /// Private half.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// PKCS#8 PEM of the private half, for one-time return to the requester.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>> {
        Ok(self.private.to_pkcs8_pem()?)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm())
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Generates a key pair.
///
/// RSA takes a `size` in `1024..=4096` and no curve, ECDSA takes a `curve`
/// and no size, Ed25519 takes neither. Any other combination fails with
/// [`PkiError::InvalidKeyParameters`].
pub fn generate_key_pair(
    kind: KeyKind,
    size: Option<u32>,
    curve: Option<EcCurve>,
) -> Result<KeyPair> {
    let algorithm = match (kind, size, curve) {
        (KeyKind::Rsa, Some(bits), None) => {
            if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
                return Err(PkiError::InvalidKeyParameters(format!(
                    "RSA size must be between {MIN_RSA_BITS} and {MAX_RSA_BITS} bits, got {bits}"
                )));
            }
            KeyAlgorithm::Rsa { bits }
        },
        (KeyKind::Rsa, None, _) => {
            return Err(PkiError::InvalidKeyParameters("RSA requires a key size".into()))
        },
        (KeyKind::Ecdsa, None, Some(curve)) => KeyAlgorithm::Ecdsa { curve },
        (KeyKind::Ecdsa, _, None) => {
            return Err(PkiError::InvalidKeyParameters("ECDSA requires a curve".into()))
        },
        (KeyKind::Ed25519, None, None) => KeyAlgorithm::Ed25519,
        (kind, size, curve) => {
            let size = size.map(|bits| format!("a size ({bits})"));
            let curve = curve.map(|curve| format!("a curve ({curve})"));
            let extra = match kind {
                KeyKind::Rsa => curve,
                KeyKind::Ecdsa => size,
                KeyKind::Ed25519 => size.or(curve),
            };
            return Err(PkiError::InvalidKeyParameters(format!(
                "{kind} does not take {}",
                extra.unwrap_or_default()
            )));
        },
    };

    generate(algorithm)
}

/// Generates a key pair for a fully specified algorithm.
pub fn generate(algorithm: KeyAlgorithm) -> Result<KeyPair> {
    let private = PrivateKey::generate(algorithm).map_err(|e| match e {
        sigil_crypto::CryptoError::InvalidKey(reason) => PkiError::InvalidKeyParameters(reason),
        other => other.into(),
    })?;
    KeyPair::from_private(private)
}
