//! # Sigil Crypto
//!
//! Core cryptographic primitives for Nubster Sigil.
//!
//! This crate provides the low-level operations the certificate authority
//! is built on:
//! - Symmetric encryption (AES-256-GCM) for wrapping private keys at rest
//! - Key derivation (HKDF-SHA256)
//! - Asymmetric key pairs and signatures (RSA, ECDSA P-256/P-384, Ed25519)
//! - SHA-256 fingerprints and key identifiers
//! - Secure random generation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod asymmetric;
pub mod digest;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod random;

pub use asymmetric::{EcCurve, KeyAlgorithm, PrivateKey, PublicKey, SignatureScheme};
pub use error::CryptoError;
pub use keys::WrappingKey;
