//! # Sigil PKI Engine
//!
//! Certificate authority core: key material, issuance, revocation and
//! validation over a pluggable record store.
//!
//! ## Features
//!
//! - RSA, ECDSA (P-256, P-384) and Ed25519 key pairs
//! - Envelope encryption of CA and subject private keys
//! - Root and intermediate CA lifecycle
//! - Profile-driven certificate issuance from generated keys or CSRs
//! - Revocation with full and delta CRLs
//! - CRL and certificate chain validation
//! - Audit events for every state change

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod authority;
pub mod chain;
pub mod config;
pub mod crl;
pub mod csr;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod extensions;
pub mod issuance;
pub mod keygen;
pub mod name;
pub mod profile;
mod revocation;
mod signing;
pub mod store;
pub mod types;
pub mod x509;

#[cfg(test)]
mod test_support;

pub use audit::{AuditAction, AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use authority::{CreateCaRequest, RotationReport};
pub use chain::{
    ChainIssue, ChainNode, ChainValidation, NodeStatus, Severity, TrustAnchorSet,
    ValidationOptions,
};
pub use config::PkiConfig;
pub use crl::CrlValidation;
pub use engine::PkiEngine;
pub use envelope::{EnvelopeCipher, WrappedKey};
pub use error::{FieldViolation, PkiError, Result};
pub use issuance::{IssueRequest, IssuedCertificate, DEFAULT_KEY_ALGORITHM};
pub use keygen::{KeyKind, KeyPair};
pub use profile::{CertificateProfile, SanEntry, SanList};
pub use types::{
    CaConfig, CaStatus, CertificateRecord, CertificateStatus, CertificateType, CrlRecord,
    RevocationReason, RevocationRecord,
};
