//! PKI engine error types.

use std::fmt;

use thiserror::Error;

use sigil_crypto::CryptoError;
use sigil_storage::StorageError;

use crate::types::CaStatus;

/// Result alias for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;

/// One rejected request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Name of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl FieldViolation {
    /// Creates a violation for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Collects field violations so a request reports all of them at once.
#[derive(Debug, Default)]
pub struct Violations(Vec<FieldViolation>);

impl Violations {
    /// Records a violation.
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldViolation::new(field, message));
    }

    /// Records a violation when `failed` is true.
    pub fn check(&mut self, failed: bool, field: &str, message: impl FnOnce() -> String) {
        if failed {
            self.push(field, message());
        }
    }

    /// Returns true when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The recorded violations.
    pub fn into_vec(self) -> Vec<FieldViolation> {
        self.0
    }

    /// `Ok` when empty, otherwise [`PkiError::Validation`] with every entry.
    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(PkiError::Validation(self.0))
        }
    }
}

fn join(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur in the PKI engine.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key algorithm, size and curve do not form a valid combination.
    #[error("invalid key parameters: {0}")]
    InvalidKeyParameters(String),

    /// A CSR could not be built, usually because the subject DN is malformed.
    #[error("CSR construction failed: {0}")]
    CsrConstruction(String),

    /// A supplied CSR is malformed or its self-signature does not verify.
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// One or more request fields are invalid.
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<FieldViolation>),

    /// The CA cannot sign in its current state.
    #[error("CA '{ca_id}' is not active (status: {status})")]
    CaNotActive {
        /// CA identifier.
        ca_id: String,
        /// Current CA status.
        status: CaStatus,
    },

    /// Every serial number candidate collided.
    #[error("no free serial number for CA '{ca_id}' after {attempts} attempts")]
    SerialExhaustion {
        /// CA identifier.
        ca_id: String,
        /// Number of candidates tried.
        attempts: u32,
    },

    /// A wrapped private key failed authentication. Never retried.
    #[error("private key decryption failed: {0}")]
    DecryptionFailed(String),

    /// The requested extensions break the profile rules.
    #[error("extension policy violation: {0}")]
    ExtensionPolicyViolation(String),

    /// No certificate with this serial number exists.
    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    /// The certificate was revoked before.
    #[error("certificate already revoked: {0}")]
    AlreadyRevoked(String),

    /// A delta CRL needs a full CRL to reference.
    #[error("CA '{0}' has no full CRL to base a delta CRL on")]
    NoBaseCrl(String),

    /// The issuer walk exceeded the configured bound.
    #[error("certificate chain length {length} exceeds maximum of {max}")]
    ChainTooLong {
        /// Length reached when the walk stopped.
        length: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No CA with this identifier exists.
    #[error("CA not found: {0}")]
    CaNotFound(String),

    /// A CA with this identifier exists already.
    #[error("CA already exists: {0}")]
    CaAlreadyExists(String),

    /// A lifecycle operation was attempted from the wrong state.
    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        /// CA id or certificate serial.
        entity: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A certificate could not be parsed or fails a structural check.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// A CRL could not be parsed.
    #[error("invalid CRL: {0}")]
    InvalidCrl(String),

    /// ASN.1 encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] der::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl PkiError {
    /// Returns true for errors the caller can fix by changing the input.
    ///
    /// Integrity failures such as [`PkiError::DecryptionFailed`] are never
    /// recoverable and must not be retried with the same inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PkiError::Validation(_)
                | PkiError::InvalidCsr(_)
                | PkiError::ExtensionPolicyViolation(_)
                | PkiError::InvalidKeyParameters(_)
                | PkiError::CsrConstruction(_)
        )
    }
}

impl From<CryptoError> for PkiError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed(reason) => PkiError::DecryptionFailed(reason),
            other => PkiError::Crypto(other),
        }
    }
}

impl From<serde_json::Error> for PkiError {
    fn from(err: serde_json::Error) -> Self {
        PkiError::Storage(StorageError::Serialization(err.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_lists_every_field() {
        let mut violations = Violations::default();
        violations.push("validity_days", "must be between 1 and 3650");
        violations.push("sans[1]", "empty DNS label");

        let err = violations.into_result().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("validity_days"));
        assert!(message.contains("sans[1]"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_decryption_failure_is_fatal() {
        let err = PkiError::from(CryptoError::DecryptionFailed("tag mismatch".into()));
        assert!(matches!(err, PkiError::DecryptionFailed(_)));
        assert!(!err.is_recoverable());
    }
}
