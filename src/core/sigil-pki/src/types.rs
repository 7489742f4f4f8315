//! Persisted records and their state machines.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use sigil_crypto::KeyAlgorithm;

use crate::envelope::WrappedKey;
use crate::error::{FieldViolation, PkiError};

// ============================================================================
// Certificate authorities
// ============================================================================

/// Lifecycle state of a CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaStatus {
    /// Key and CSR exist, no certificate yet.
    Initializing,
    /// Certificate installed; the CA may sign.
    Active,
    /// Signing disabled until re-validated.
    Suspended,
}

impl fmt::Display for CaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaStatus::Initializing => write!(f, "INITIALIZING"),
            CaStatus::Active => write!(f, "ACTIVE"),
            CaStatus::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

/// A certificate authority as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    /// Identifier (`[a-z0-9_-]+`).
    pub id: String,
    /// Subject distinguished name.
    pub subject: String,
    /// Key algorithm, size or curve.
    pub key_algorithm: KeyAlgorithm,
    /// Envelope-encrypted PKCS#8 private key.
    pub wrapped_key: WrappedKey,
    /// Public key as SPKI PEM.
    pub public_key_pem: String,
    /// PKCS#10 request, present until the CA is activated.
    pub csr_pem: Option<String>,
    /// Lifecycle state.
    pub status: CaStatus,
    /// The CA's own certificate once activated.
    pub certificate_pem: Option<String>,
    /// Issuer chain above the CA certificate, nearest issuer first.
    #[serde(default)]
    pub chain_pem: Vec<String>,
    /// Start of the CA certificate's validity (unix seconds).
    pub not_before: Option<u64>,
    /// End of the CA certificate's validity (unix seconds).
    pub not_after: Option<u64>,
    /// CRL distribution point URL put into issued certificates.
    pub crl_url: Option<String>,
    /// OCSP responder URL put into issued certificates.
    pub ocsp_url: Option<String>,
    /// Last allocated CRL number; 0 before the first CRL.
    pub crl_number: u64,
    /// Parent CA for intermediates created by this engine.
    pub parent_id: Option<String>,
    /// Creation time (unix seconds).
    pub created_at: u64,
    /// Last update time (unix seconds).
    pub updated_at: u64,
}

impl CaConfig {
    /// A CA may sign only while active and holding a certificate.
    pub fn can_sign(&self) -> bool {
        self.status == CaStatus::Active && self.certificate_pem.is_some()
    }
}

// ============================================================================
// Certificates
// ============================================================================

/// Role of an issued certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateType {
    /// TLS server.
    Server,
    /// TLS client.
    Client,
    /// Subordinate certificate authority.
    Ca,
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateType::Server => write!(f, "SERVER"),
            CertificateType::Client => write!(f, "CLIENT"),
            CertificateType::Ca => write!(f, "CA"),
        }
    }
}

impl FromStr for CertificateType {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(CertificateType::Server),
            "client" => Ok(CertificateType::Client),
            "ca" => Ok(CertificateType::Ca),
            _ => Err(PkiError::Validation(vec![FieldViolation::new(
                "cert_type",
                format!("unknown certificate type '{s}', expected SERVER, CLIENT or CA"),
            )])),
        }
    }
}

/// Stored status of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateStatus {
    /// Accepted but not yet signed.
    Pending,
    /// Signed and usable.
    Active,
    /// Past its validity window.
    Expired,
    /// Revoked. Terminal.
    Revoked,
}

impl CertificateStatus {
    /// Status transitions only move forward.
    ///
    /// An expired certificate may still be revoked so that it appears on CRLs.
    pub fn can_transition_to(self, next: CertificateStatus) -> bool {
        use CertificateStatus::*;
        matches!(
            (self, next),
            (Pending, Active) | (Active, Expired) | (Active, Revoked) | (Expired, Revoked)
        )
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateStatus::Pending => write!(f, "PENDING"),
            CertificateStatus::Active => write!(f, "ACTIVE"),
            CertificateStatus::Expired => write!(f, "EXPIRED"),
            CertificateStatus::Revoked => write!(f, "REVOKED"),
        }
    }
}

/// An issued certificate as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Serial number, lowercase hex.
    pub serial: String,
    /// Issuing CA.
    pub ca_id: String,
    /// Subject DN.
    pub subject: String,
    /// Issuer DN.
    pub issuer: String,
    /// Certificate role.
    pub cert_type: CertificateType,
    /// Subject key algorithm.
    pub key_algorithm: KeyAlgorithm,
    /// Start of validity (unix seconds).
    pub not_before: u64,
    /// End of validity (unix seconds).
    pub not_after: u64,
    /// PEM encoding.
    pub certificate_pem: String,
    /// SHA-256 fingerprint of the DER encoding.
    pub fingerprint: String,
    /// Stored status.
    pub status: CertificateStatus,
    /// Identity that requested issuance.
    pub issued_by: String,
    /// Subject private key, only when the requester opted in to storage.
    pub wrapped_key: Option<WrappedKey>,
    /// Issuance time (unix seconds).
    pub created_at: u64,
}

impl CertificateRecord {
    /// Status as of `now`: a stored `ACTIVE` past `not_after` reads as `EXPIRED`.
    pub fn effective_status(&self, now: u64) -> CertificateStatus {
        if self.status == CertificateStatus::Active && now > self.not_after {
            CertificateStatus::Expired
        } else {
            self.status
        }
    }
}

// ============================================================================
// Revocation
// ============================================================================

/// Why a certificate was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevocationReason {
    /// The subject's private key is known or suspected to be compromised.
    KeyCompromise,
    /// The issuing CA's key is compromised.
    CaCompromise,
    /// Subject name or other information changed.
    AffiliationChanged,
    /// Replaced by a new certificate.
    Superseded,
    /// No longer needed.
    CessationOfOperation,
    /// Temporarily on hold.
    CertificateHold,
    /// Administrative override: the certificate stays revoked but is
    /// left out of every future CRL.
    RemoveFromCrl,
}

impl RevocationReason {
    /// Every reason, in CRL reason code order.
    pub const ALL: [RevocationReason; 7] = [
        RevocationReason::KeyCompromise,
        RevocationReason::CaCompromise,
        RevocationReason::AffiliationChanged,
        RevocationReason::Superseded,
        RevocationReason::CessationOfOperation,
        RevocationReason::CertificateHold,
        RevocationReason::RemoveFromCrl,
    ];

    /// Whether revocations with this reason are listed on CRLs.
    pub fn appears_on_crl(self) -> bool {
        self != RevocationReason::RemoveFromCrl
    }

    /// Canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            RevocationReason::KeyCompromise => "KEY_COMPROMISE",
            RevocationReason::CaCompromise => "CA_COMPROMISE",
            RevocationReason::AffiliationChanged => "AFFILIATION_CHANGED",
            RevocationReason::Superseded => "SUPERSEDED",
            RevocationReason::CessationOfOperation => "CESSATION_OF_OPERATION",
            RevocationReason::CertificateHold => "CERTIFICATE_HOLD",
            RevocationReason::RemoveFromCrl => "REMOVE_FROM_CRL",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = PkiError;

    /// Accepts `KEY_COMPROMISE`, `key-compromise` and `key_compromise`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        RevocationReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == normalized)
            .ok_or_else(|| {
                PkiError::Validation(vec![FieldViolation::new(
                    "reason",
                    format!("unknown revocation reason '{s}'"),
                )])
            })
    }
}

/// A revocation as persisted. Created once per certificate, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    /// Revoked serial, lowercase hex.
    pub serial: String,
    /// Issuing CA.
    pub ca_id: String,
    /// Revocation time (unix seconds).
    pub revoked_at: u64,
    /// Reason.
    pub reason: RevocationReason,
    /// Identity that revoked the certificate.
    pub revoked_by: String,
}

// ============================================================================
// CRLs
// ============================================================================

/// A generated CRL as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlRecord {
    /// Issuing CA.
    pub ca_id: String,
    /// CRL number.
    pub number: u64,
    /// Issuer DN.
    pub issuer: String,
    /// thisUpdate (unix seconds).
    pub this_update: u64,
    /// nextUpdate (unix seconds).
    pub next_update: u64,
    /// For a delta CRL, the number of the full CRL it extends.
    pub delta_of: Option<u64>,
    /// Serials listed, lowercase hex.
    pub entries: Vec<String>,
    /// DER encoding.
    #[serde(with = "base64_bytes")]
    pub crl_der: Vec<u8>,
}

impl CrlRecord {
    /// Number of listed certificates.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// True for delta CRLs.
    pub fn is_delta(&self) -> bool {
        self.delta_of.is_some()
    }
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use CertificateStatus::*;

        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Revoked));
        assert!(Active.can_transition_to(Expired));
        assert!(Expired.can_transition_to(Revoked));

        assert!(!Revoked.can_transition_to(Active));
        assert!(!Revoked.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Active.can_transition_to(Pending));
    }

    #[test]
    fn test_revocation_reason_parsing() {
        assert_eq!(
            "KEY_COMPROMISE".parse::<RevocationReason>().unwrap(),
            RevocationReason::KeyCompromise
        );
        assert_eq!(
            "remove-from-crl".parse::<RevocationReason>().unwrap(),
            RevocationReason::RemoveFromCrl
        );
        for reason in RevocationReason::ALL {
            assert_eq!(reason.as_str().parse::<RevocationReason>().unwrap(), reason);
        }

        let err = "UNSPECIFIED".parse::<RevocationReason>().unwrap_err();
        assert!(matches!(err, PkiError::Validation(ref v) if v[0].field == "reason"));
        assert!("lost laptop".parse::<RevocationReason>().is_err());
    }

    #[test]
    fn test_remove_from_crl_is_excluded() {
        assert!(!RevocationReason::RemoveFromCrl.appears_on_crl());
        assert!(RevocationReason::CertificateHold.appears_on_crl());
    }

    #[test]
    fn test_certificate_type_parsing() {
        assert_eq!("server".parse::<CertificateType>().unwrap(), CertificateType::Server);
        assert_eq!("CA".parse::<CertificateType>().unwrap(), CertificateType::Ca);
        assert!("codesign".parse::<CertificateType>().is_err());
    }

    #[test]
    fn test_crl_record_der_is_base64_in_json() {
        let record = CrlRecord {
            ca_id: "root".into(),
            number: 3,
            issuer: "CN=Root".into(),
            this_update: 10,
            next_update: 20,
            delta_of: Some(2),
            entries: vec!["01".into()],
            crl_der: vec![0x30, 0x03, 0x02, 0x01, 0x01],
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["crl_der"], "MAMCAQE=");

        let back: CrlRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.crl_der, record.crl_der);
        assert!(back.is_delta());
        assert_eq!(back.entry_count(), 1);
    }
}
