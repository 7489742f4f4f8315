//! Asymmetric key pairs and signatures.
//!
//! Supports RSA (PKCS#1 v1.5), ECDSA over NIST P-256 and P-384, and Ed25519.
//! A [`PrivateKey`] holds PKCS#8 DER in a zeroizing buffer and parses it into a
//! signing key only for the duration of one `sign` call.

use std::fmt;
use std::str::FromStr;

use const_oid::{AssociatedOid, ObjectIdentifier};
use der::pem::LineEnding;
use der::Decode;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, PrivateKeyInfo};
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use signature::hazmat::PrehashVerifier;
use signature::{SignatureEncoding, Signer, Verifier};
use spki::{DecodePublicKey, EncodePublicKey, SubjectPublicKeyInfoRef};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// rsaEncryption (RFC 8017).
pub const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
/// id-ecPublicKey (RFC 5480).
pub const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
/// secp256r1 named curve.
pub const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
/// secp384r1 named curve.
pub const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
/// secp521r1 named curve.
pub const SECP521R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.35");
/// id-Ed25519 (RFC 8410).
pub const ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

/// Smallest RSA modulus accepted for key generation.
pub const MIN_RSA_BITS: u32 = 1024;
/// Largest RSA modulus accepted for key generation.
pub const MAX_RSA_BITS: u32 = 4096;

const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";
const PUBLIC_KEY_LABEL: &str = "PUBLIC KEY";

// ============================================================================
// Algorithms
// ============================================================================

/// Named curves supported for ECDSA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EcCurve {
    /// NIST P-256 (secp256r1).
    #[serde(rename = "P-256")]
    P256,
    /// NIST P-384 (secp384r1).
    #[serde(rename = "P-384")]
    P384,
}

impl EcCurve {
    /// Curve OID as carried in SPKI parameters.
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            EcCurve::P256 => SECP256R1,
            EcCurve::P384 => SECP384R1,
        }
    }
}

impl fmt::Display for EcCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcCurve::P256 => f.write_str("P-256"),
            EcCurve::P384 => f.write_str("P-384"),
        }
    }
}

impl FromStr for EcCurve {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p-256" | "p256" | "secp256r1" | "prime256v1" => Ok(EcCurve::P256),
            "p-384" | "p384" | "secp384r1" => Ok(EcCurve::P384),
            other => Err(CryptoError::UnsupportedAlgorithm(format!("curve {other}"))),
        }
    }
}

/// A fully specified key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyAlgorithm {
    /// RSA with the given modulus size.
    Rsa {
        /// Modulus size in bits.
        bits: u32,
    },
    /// ECDSA on a named curve.
    Ecdsa {
        /// Named curve.
        curve: EcCurve,
    },
    /// Ed25519.
    Ed25519,
}

impl KeyAlgorithm {
    /// Signature scheme used when this key signs certificates, CRLs and CSRs.
    ///
    /// SHA-256 for RSA and P-256, SHA-384 for P-384 to match its security level.
    pub fn signature_scheme(self) -> SignatureScheme {
        match self {
            KeyAlgorithm::Rsa { .. } => SignatureScheme::RsaPkcs1Sha256,
            KeyAlgorithm::Ecdsa { curve: EcCurve::P256 } => SignatureScheme::EcdsaSha256,
            KeyAlgorithm::Ecdsa { curve: EcCurve::P384 } => SignatureScheme::EcdsaSha384,
            KeyAlgorithm::Ed25519 => SignatureScheme::Ed25519,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa { bits } => write!(f, "RSA-{bits}"),
            KeyAlgorithm::Ecdsa { curve } => write!(f, "ECDSA-{curve}"),
            KeyAlgorithm::Ed25519 => f.write_str("Ed25519"),
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = CryptoError;

    /// Parses `rsa-2048`, `ecdsa-p256`, `ecdsa-p384` or `ed25519`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower == "ed25519" {
            return Ok(KeyAlgorithm::Ed25519);
        }
        if let Some(bits) = lower.strip_prefix("rsa-") {
            let bits = bits
                .parse()
                .map_err(|_| CryptoError::InvalidInput(format!("invalid RSA size: {bits}")))?;
            return Ok(KeyAlgorithm::Rsa { bits });
        }
        if let Some(curve) = lower.strip_prefix("ecdsa-") {
            return Ok(KeyAlgorithm::Ecdsa {
                curve: curve.parse()?,
            });
        }
        Err(CryptoError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// Signature algorithms Sigil can produce or verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    /// sha256WithRSAEncryption.
    RsaPkcs1Sha256,
    /// sha384WithRSAEncryption.
    RsaPkcs1Sha384,
    /// sha512WithRSAEncryption.
    RsaPkcs1Sha512,
    /// ecdsa-with-SHA256.
    EcdsaSha256,
    /// ecdsa-with-SHA384.
    EcdsaSha384,
    /// ecdsa-with-SHA512.
    EcdsaSha512,
    /// Ed25519 (pure).
    Ed25519,
}

const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const SHA384_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const SHA512_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");
const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
const ECDSA_WITH_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4");

impl SignatureScheme {
    /// AlgorithmIdentifier OID.
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            SignatureScheme::RsaPkcs1Sha256 => SHA256_WITH_RSA,
            SignatureScheme::RsaPkcs1Sha384 => SHA384_WITH_RSA,
            SignatureScheme::RsaPkcs1Sha512 => SHA512_WITH_RSA,
            SignatureScheme::EcdsaSha256 => ECDSA_WITH_SHA256,
            SignatureScheme::EcdsaSha384 => ECDSA_WITH_SHA384,
            SignatureScheme::EcdsaSha512 => ECDSA_WITH_SHA512,
            SignatureScheme::Ed25519 => ED25519,
        }
    }

    /// Looks up a scheme by its AlgorithmIdentifier OID.
    pub fn from_oid(oid: ObjectIdentifier) -> Option<Self> {
        [
            SignatureScheme::RsaPkcs1Sha256,
            SignatureScheme::RsaPkcs1Sha384,
            SignatureScheme::RsaPkcs1Sha512,
            SignatureScheme::EcdsaSha256,
            SignatureScheme::EcdsaSha384,
            SignatureScheme::EcdsaSha512,
            SignatureScheme::Ed25519,
        ]
        .into_iter()
        .find(|scheme| scheme.oid() == oid)
    }

    /// RSA AlgorithmIdentifiers carry explicit NULL parameters; ECDSA and
    /// Ed25519 ones omit them.
    pub fn has_null_parameters(self) -> bool {
        matches!(
            self,
            SignatureScheme::RsaPkcs1Sha256
                | SignatureScheme::RsaPkcs1Sha384
                | SignatureScheme::RsaPkcs1Sha512
        )
    }

    fn prehash(self, msg: &[u8]) -> Vec<u8> {
        match self {
            SignatureScheme::EcdsaSha384 | SignatureScheme::RsaPkcs1Sha384 => {
                Sha384::digest(msg).to_vec()
            },
            SignatureScheme::EcdsaSha512 | SignatureScheme::RsaPkcs1Sha512 => {
                Sha512::digest(msg).to_vec()
            },
            _ => Sha256::digest(msg).to_vec(),
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignatureScheme::RsaPkcs1Sha256 => "sha256WithRSAEncryption",
            SignatureScheme::RsaPkcs1Sha384 => "sha384WithRSAEncryption",
            SignatureScheme::RsaPkcs1Sha512 => "sha512WithRSAEncryption",
            SignatureScheme::EcdsaSha256 => "ecdsa-with-SHA256",
            SignatureScheme::EcdsaSha384 => "ecdsa-with-SHA384",
            SignatureScheme::EcdsaSha512 => "ecdsa-with-SHA512",
            SignatureScheme::Ed25519 => "Ed25519",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Private keys
// ============================================================================

/// A private key held as PKCS#8 DER.
///
/// The DER buffer is zeroized on drop. Signing keys parsed from it inside
/// [`PrivateKey::sign`] are dropped before the call returns.
pub struct PrivateKey {
    algorithm: KeyAlgorithm,
    pkcs8: Zeroizing<Vec<u8>>,
}

impl PrivateKey {
    /// Generates a fresh key pair for `algorithm`.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self, CryptoError> {
        let doc = match algorithm {
            KeyAlgorithm::Rsa { bits } => {
                if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
                    return Err(CryptoError::InvalidKey(format!(
                        "RSA size must be between {MIN_RSA_BITS} and {MAX_RSA_BITS} bits, got {bits}"
                    )));
                }
                let key = rsa::RsaPrivateKey::new(&mut OsRng, bits as usize)
                    .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;
                key.to_pkcs8_der()
            },
            KeyAlgorithm::Ecdsa { curve: EcCurve::P256 } => {
                p256::SecretKey::random(&mut OsRng).to_pkcs8_der()
            },
            KeyAlgorithm::Ecdsa { curve: EcCurve::P384 } => {
                p384::SecretKey::random(&mut OsRng).to_pkcs8_der()
            },
            KeyAlgorithm::Ed25519 => ed25519_dalek::SigningKey::generate(&mut OsRng).to_pkcs8_der(),
        }
        .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;

        Ok(Self {
            algorithm,
            pkcs8: Zeroizing::new(doc.as_bytes().to_vec()),
        })
    }

    /// Parses a PKCS#8 DER private key, detecting its algorithm.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let info =
            PrivateKeyInfo::try_from(der).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let algorithm = match info.algorithm.oid {
            oid if oid == RSA_ENCRYPTION => {
                let key = rsa::RsaPrivateKey::from_pkcs8_der(der)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                KeyAlgorithm::Rsa {
                    bits: (key.size() * 8) as u32,
                }
            },
            oid if oid == EC_PUBLIC_KEY => {
                if p256::SecretKey::from_pkcs8_der(der).is_ok() {
                    KeyAlgorithm::Ecdsa {
                        curve: EcCurve::P256,
                    }
                } else if p384::SecretKey::from_pkcs8_der(der).is_ok() {
                    KeyAlgorithm::Ecdsa {
                        curve: EcCurve::P384,
                    }
                } else {
                    return Err(CryptoError::UnsupportedAlgorithm(
                        "elliptic curve is not P-256 or P-384".into(),
                    ));
                }
            },
            oid if oid == ED25519 => {
                ed25519_dalek::SigningKey::from_pkcs8_der(der)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                KeyAlgorithm::Ed25519
            },
            other => return Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        };

        Ok(Self {
            algorithm,
            pkcs8: Zeroizing::new(der.to_vec()),
        })
    }

    /// Parses a `PRIVATE KEY` PEM block.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let (label, der) = der::pem::decode_vec(pem.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let der = Zeroizing::new(der);
        if label != PRIVATE_KEY_LABEL {
            return Err(CryptoError::InvalidKey(format!(
                "expected {PRIVATE_KEY_LABEL} PEM, got {label}"
            )));
        }
        Self::from_pkcs8_der(&der)
    }

    /// Returns the key algorithm.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Returns the PKCS#8 DER bytes.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Encodes the key as a `PRIVATE KEY` PEM block.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        der::pem::encode_string(PRIVATE_KEY_LABEL, LineEnding::LF, &self.pkcs8)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Derives the matching public key.
    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        let doc = match self.algorithm {
            KeyAlgorithm::Rsa { .. } => rsa::RsaPrivateKey::from_pkcs8_der(&self.pkcs8)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
                .to_public_key()
                .to_public_key_der(),
            KeyAlgorithm::Ecdsa { curve: EcCurve::P256 } => {
                p256::SecretKey::from_pkcs8_der(&self.pkcs8)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
                    .public_key()
                    .to_public_key_der()
            },
            KeyAlgorithm::Ecdsa { curve: EcCurve::P384 } => {
                p384::SecretKey::from_pkcs8_der(&self.pkcs8)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
                    .public_key()
                    .to_public_key_der()
            },
            KeyAlgorithm::Ed25519 => ed25519_dalek::SigningKey::from_pkcs8_der(&self.pkcs8)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
                .verifying_key()
                .to_public_key_der(),
        }
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        PublicKey::from_spki_der(doc.as_bytes())
    }

    /// Signs `msg` with this key's [`KeyAlgorithm::signature_scheme`].
    ///
    /// ECDSA signatures are returned DER-encoded, as X.509 expects.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sign_err = |e: signature::Error| CryptoError::SignatureFailed(e.to_string());
        let key_err = |e: pkcs8::Error| CryptoError::InvalidKey(e.to_string());

        match self.algorithm {
            KeyAlgorithm::Rsa { .. } => {
                let key = rsa::RsaPrivateKey::from_pkcs8_der(&self.pkcs8).map_err(key_err)?;
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key);
                Ok(signer.try_sign(msg).map_err(sign_err)?.to_vec())
            },
            KeyAlgorithm::Ecdsa { curve: EcCurve::P256 } => {
                let secret = p256::SecretKey::from_pkcs8_der(&self.pkcs8).map_err(key_err)?;
                let signer = p256::ecdsa::SigningKey::from(&secret);
                let sig: p256::ecdsa::Signature = signer.try_sign(msg).map_err(sign_err)?;
                Ok(sig.to_der().as_bytes().to_vec())
            },
            KeyAlgorithm::Ecdsa { curve: EcCurve::P384 } => {
                let secret = p384::SecretKey::from_pkcs8_der(&self.pkcs8).map_err(key_err)?;
                let signer = p384::ecdsa::SigningKey::from(&secret);
                let sig: p384::ecdsa::Signature = signer.try_sign(msg).map_err(sign_err)?;
                Ok(sig.to_der().as_bytes().to_vec())
            },
            KeyAlgorithm::Ed25519 => {
                let signer = ed25519_dalek::SigningKey::from_pkcs8_der(&self.pkcs8).map_err(key_err)?;
                let sig: ed25519_dalek::Signature = signer.try_sign(msg).map_err(sign_err)?;
                Ok(sig.to_bytes().to_vec())
            },
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .field("pkcs8", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// Public keys
// ============================================================================

#[derive(Clone)]
enum VerifyingKey {
    Rsa(rsa::RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

/// A parsed SubjectPublicKeyInfo.
#[derive(Clone)]
pub struct PublicKey {
    algorithm: KeyAlgorithm,
    key: VerifyingKey,
    spki_der: Vec<u8>,
    subject_public_key: Vec<u8>,
}

impl PublicKey {
    /// Parses a DER SubjectPublicKeyInfo.
    ///
    /// Fails with `UnsupportedAlgorithm` for key types or curves Sigil
    /// cannot verify with.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, CryptoError> {
        let spki =
            SubjectPublicKeyInfoRef::from_der(der).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key_err = |e: spki::Error| CryptoError::InvalidKey(e.to_string());

        let (algorithm, key) = match spki.algorithm.oid {
            oid if oid == RSA_ENCRYPTION => {
                let key = rsa::RsaPublicKey::from_public_key_der(der).map_err(key_err)?;
                let bits = (key.size() * 8) as u32;
                (KeyAlgorithm::Rsa { bits }, VerifyingKey::Rsa(key))
            },
            oid if oid == EC_PUBLIC_KEY => {
                if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
                    (
                        KeyAlgorithm::Ecdsa {
                            curve: EcCurve::P256,
                        },
                        VerifyingKey::P256(key),
                    )
                } else if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(der) {
                    (
                        KeyAlgorithm::Ecdsa {
                            curve: EcCurve::P384,
                        },
                        VerifyingKey::P384(key),
                    )
                } else {
                    return Err(CryptoError::UnsupportedAlgorithm(
                        "elliptic curve is not P-256 or P-384".into(),
                    ));
                }
            },
            oid if oid == ED25519 => {
                let key = ed25519_dalek::VerifyingKey::from_public_key_der(der).map_err(key_err)?;
                (KeyAlgorithm::Ed25519, VerifyingKey::Ed25519(key))
            },
            other => return Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        };

        Ok(Self {
            algorithm,
            key,
            spki_der: der.to_vec(),
            subject_public_key: spki.subject_public_key.raw_bytes().to_vec(),
        })
    }

    /// Parses a `PUBLIC KEY` PEM block.
    pub fn from_spki_pem(pem: &str) -> Result<Self, CryptoError> {
        let (label, der) = der::pem::decode_vec(pem.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if label != PUBLIC_KEY_LABEL {
            return Err(CryptoError::InvalidKey(format!(
                "expected {PUBLIC_KEY_LABEL} PEM, got {label}"
            )));
        }
        Self::from_spki_der(&der)
    }

    /// Returns the key algorithm.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Returns the full SubjectPublicKeyInfo DER.
    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    /// Returns the subjectPublicKey BIT STRING contents.
    pub fn subject_public_key(&self) -> &[u8] {
        &self.subject_public_key
    }

    /// Encodes the key as a `PUBLIC KEY` PEM block.
    pub fn to_spki_pem(&self) -> Result<String, CryptoError> {
        der::pem::encode_string(PUBLIC_KEY_LABEL, LineEnding::LF, &self.spki_der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Verifies `signature` over `msg` using `scheme`.
    ///
    /// The scheme must belong to this key's family; ECDSA keys accept any of
    /// the SHA-2 digests.
    pub fn verify(
        &self,
        scheme: SignatureScheme,
        msg: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        match (&self.key, scheme) {
            (VerifyingKey::Rsa(key), SignatureScheme::RsaPkcs1Sha256) => {
                verify_rsa::<Sha256>(key, msg, signature)
            },
            (VerifyingKey::Rsa(key), SignatureScheme::RsaPkcs1Sha384) => {
                verify_rsa::<Sha384>(key, msg, signature)
            },
            (VerifyingKey::Rsa(key), SignatureScheme::RsaPkcs1Sha512) => {
                verify_rsa::<Sha512>(key, msg, signature)
            },
            (
                VerifyingKey::P256(key),
                SignatureScheme::EcdsaSha256 | SignatureScheme::EcdsaSha384 | SignatureScheme::EcdsaSha512,
            ) => {
                let sig = p256::ecdsa::Signature::from_der(signature)
                    .map_err(|_| CryptoError::VerificationFailed)?;
                key.verify_prehash(&scheme.prehash(msg), &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            },
            (
                VerifyingKey::P384(key),
                SignatureScheme::EcdsaSha256 | SignatureScheme::EcdsaSha384 | SignatureScheme::EcdsaSha512,
            ) => {
                let sig = p384::ecdsa::Signature::from_der(signature)
                    .map_err(|_| CryptoError::VerificationFailed)?;
                key.verify_prehash(&scheme.prehash(msg), &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            },
            (VerifyingKey::Ed25519(key), SignatureScheme::Ed25519) => {
                let sig = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| CryptoError::VerificationFailed)?;
                key.verify(msg, &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            },
            (_, scheme) => Err(CryptoError::UnsupportedAlgorithm(format!(
                "{scheme} cannot be verified with a {} key",
                self.algorithm
            ))),
        }
    }
}

fn verify_rsa<D>(key: &rsa::RsaPublicKey, msg: &[u8], signature: &[u8]) -> Result<(), CryptoError>
where
    D: Digest + AssociatedOid,
{
    let verifier = rsa::pkcs1v15::VerifyingKey::<D>::new(key.clone());
    let sig = rsa::pkcs1v15::Signature::try_from(signature)
        .map_err(|_| CryptoError::VerificationFailed)?;
    verifier
        .verify(msg, &sig)
        .map_err(|_| CryptoError::VerificationFailed)
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.spki_der == other.spki_der
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("spki_len", &self.spki_der.len())
            .finish()
    }
}
