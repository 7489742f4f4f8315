//! Certificate issuance.
//!
//! [`PkiEngine::issue`] runs the whole pipeline for one certificate: CA state
//! check, CSR intake or key generation, request validation, extension
//! assembly, serial reservation, signing under the CA key and persistence.
//! Nothing is persisted unless signing succeeded.

use der::Encode;
use serde::{Deserialize, Serialize};
use spki::SubjectPublicKeyInfoOwned;
use tracing::{debug, info, warn};
use x509_cert::certificate::{TbsCertificateInner, Version};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;
use x509_cert::Certificate;
use zeroize::Zeroizing;

use sigil_crypto::digest::fingerprint;
use sigil_crypto::random::generate_serial;
use sigil_crypto::{EcCurve, KeyAlgorithm, PublicKey, SignatureScheme};

use crate::audit::{AuditAction, AuditEvent};
use crate::csr::parse_and_verify;
use crate::engine::PkiEngine;
use crate::error::{FieldViolation, PkiError, Result, Violations};
use crate::extensions::{build_extensions, IssuerContext};
use crate::keygen::{self, KeyPair};
use crate::name::{display_name, DistinguishedName};
use crate::profile::CertificateProfile;
use crate::signing::{sign_certificate, with_signing_key};
use crate::types::{CaConfig, CertificateRecord, CertificateStatus};
use crate::x509::{self, algorithm_identifier, certificate_pem, parse_certificate, serial_hex};

const SECONDS_PER_DAY: u64 = 86_400;

/// Key algorithm used when a request names none.
pub const DEFAULT_KEY_ALGORITHM: KeyAlgorithm = KeyAlgorithm::Ecdsa {
    curve: EcCurve::P256,
};

/// A request to issue one certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRequest {
    /// Issuing CA.
    pub ca_id: String,
    /// Subject DN. Falls back to the CSR subject when a CSR is supplied.
    pub subject_dn: Option<String>,
    /// Role and extension policy.
    pub profile: CertificateProfile,
    /// Validity in days.
    pub validity_days: u32,
    /// Externally generated CSR. Without one, a key pair is generated.
    pub csr_pem: Option<String>,
    /// Algorithm of the generated key pair.
    pub key_algorithm: Option<KeyAlgorithm>,
    /// Keep the generated private key, envelope-encrypted.
    #[serde(default)]
    pub store_private_key: bool,
}

impl IssueRequest {
    /// Request for a generated key pair, valid for one year.
    pub fn new(ca_id: impl Into<String>, subject_dn: impl Into<String>, profile: CertificateProfile) -> Self {
        Self {
            ca_id: ca_id.into(),
            subject_dn: Some(subject_dn.into()),
            profile,
            validity_days: 365,
            csr_pem: None,
            key_algorithm: None,
            store_private_key: false,
        }
    }
}

/// Result of a successful issuance.
pub struct IssuedCertificate {
    /// PEM encoding.
    pub certificate_pem: String,
    /// DER encoding.
    pub certificate_der: Vec<u8>,
    /// Serial number, lowercase hex.
    pub serial: String,
    /// SHA-256 fingerprint of the DER encoding.
    pub fingerprint: String,
    /// Generated private key, returned exactly once.
    pub private_key_pem: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("serial", &self.serial)
            .field("fingerprint", &self.fingerprint)
            .field(
                "private_key_pem",
                &self.private_key_pem.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Where the subject key comes from.
enum SubjectKey {
    Csr(PublicKey),
    Generated(KeyPair),
}

impl SubjectKey {
    fn public_key(&self) -> &PublicKey {
        match self {
            SubjectKey::Csr(key) => key,
            SubjectKey::Generated(pair) => pair.public_key(),
        }
    }
}

/// Inputs of a to-be-signed certificate body.
pub(crate) struct TbsParams {
    pub serial: SerialNumber,
    pub scheme: SignatureScheme,
    pub issuer: Name,
    pub subject: Name,
    pub subject_public_key: SubjectPublicKeyInfoOwned,
    pub not_before: u64,
    pub not_after: u64,
    pub extensions: Vec<Extension>,
}

/// Assembles a v3 certificate body.
pub(crate) fn tbs_certificate(params: TbsParams) -> Result<TbsCertificateInner> {
    Ok(TbsCertificateInner {
        version: Version::V3,
        serial_number: params.serial,
        signature: algorithm_identifier(params.scheme),
        issuer: params.issuer,
        validity: Validity {
            not_before: x509::to_time(params.not_before)?,
            not_after: x509::to_time(params.not_after)?,
        },
        subject: params.subject,
        subject_public_key_info: params.subject_public_key,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(params.extensions),
    })
}

/// Collects a violation if `algorithm` is below the configured strength.
pub(crate) fn check_key_strength(
    violations: &mut Violations,
    field: &str,
    algorithm: KeyAlgorithm,
    min_rsa_bits: u32,
) {
    if let KeyAlgorithm::Rsa { bits } = algorithm {
        violations.check(bits < min_rsa_bits, field, || {
            format!("RSA-{bits} is below the minimum of {min_rsa_bits} bits")
        });
    }
}

/// Validity window of a new certificate, checked against the issuer's.
pub(crate) fn validity_window(
    violations: &mut Violations,
    validity_days: u32,
    max_days: u32,
    issuer_not_after: Option<u64>,
    now: u64,
) -> (u64, u64) {
    violations.check(
        validity_days == 0 || validity_days > max_days,
        "validity_days",
        || format!("must be between 1 and {max_days}, got {validity_days}"),
    );
    let not_after = now + u64::from(validity_days) * SECONDS_PER_DAY;
    if let Some(limit) = issuer_not_after {
        violations.check(not_after > limit, "validity_days", || {
            format!(
                "certificate would outlive its issuer ({} days left)",
                limit.saturating_sub(now) / SECONDS_PER_DAY
            )
        });
    }
    (now, not_after)
}

impl PkiEngine {
    /// Issues a certificate from `ca_id` on behalf of `actor`.
    ///
    /// Request problems are gathered into one [`PkiError::Validation`]. A CA
    /// that is not `ACTIVE` fails with [`PkiError::CaNotActive`], a bad CSR
    /// with [`PkiError::InvalidCsr`].
    pub async fn issue(&self, request: IssueRequest, actor: &str) -> Result<IssuedCertificate> {
        let _rotation = self.rotation.read().await;
        let lock = self.ca_lock(&request.ca_id);
        let _guard = lock.lock().await;

        let ca = self.store.require_ca(&request.ca_id).await?;
        if !ca.can_sign() {
            return Err(PkiError::CaNotActive {
                ca_id: ca.id,
                status: ca.status,
            });
        }

        let now = Self::now();
        let mut violations = Violations::default();
        let mut profile = request.profile;

        let csr = request
            .csr_pem
            .as_deref()
            .map(|pem| parse_and_verify(pem.as_bytes()))
            .transpose()?;
        let algorithm = request.key_algorithm.unwrap_or(DEFAULT_KEY_ALGORITHM);

        match &csr {
            Some(csr) => {
                check_key_strength(
                    &mut violations,
                    "csr",
                    csr.public_key.algorithm(),
                    self.config.min_rsa_bits,
                );
                violations.check(request.store_private_key, "store_private_key", || {
                    "no private key to store when a CSR is supplied".into()
                });
                violations.check(request.key_algorithm.is_some(), "key_algorithm", || {
                    "the key algorithm is fixed by the CSR".into()
                });
            },
            None => {
                check_key_strength(
                    &mut violations,
                    "key_algorithm",
                    algorithm,
                    self.config.min_rsa_bits,
                );
            },
        }

        let subject = match (&request.subject_dn, &csr) {
            (Some(dn), _) => match DistinguishedName::parse(dn)
                .map_err(|e| e.to_string())
                .and_then(|dn| dn.to_name().map_err(|e| e.to_string()))
            {
                Ok(name) => Some(name),
                Err(reason) => {
                    violations.push("subject_dn", reason);
                    None
                },
            },
            (None, Some(csr)) => Some(csr.subject.clone()),
            (None, None) => {
                violations.push("subject_dn", "required when no CSR is supplied");
                None
            },
        };

        let (not_before, not_after) = validity_window(
            &mut violations,
            request.validity_days,
            self.config.max_validity_days,
            ca.not_after,
            now,
        );

        violations.into_result()?;
        let Some(subject) = subject else {
            return Err(PkiError::Validation(vec![FieldViolation::new("subject_dn", "missing")]));
        };

        let subject_key = match csr {
            Some(csr) => {
                profile = profile.with_default_sans(csr.requested_sans);
                SubjectKey::Csr(csr.public_key)
            },
            None => SubjectKey::Generated(keygen::generate(algorithm)?),
        };

        let issued = self
            .sign_for_ca(&ca, &profile, subject, subject_key.public_key(), not_before, not_after)
            .await?;
        let cert = &issued.certificate;

        let (wrapped_key, private_key_pem) = match &subject_key {
            SubjectKey::Generated(pair) => {
                let wrapped = if request.store_private_key {
                    Some(self.cipher().wrap(pair.private_key().pkcs8_der())?)
                } else {
                    None
                };
                (wrapped, Some(pair.private_key_pem()?))
            },
            SubjectKey::Csr(_) => (None, None),
        };

        let record = CertificateRecord {
            serial: issued.serial.clone(),
            ca_id: ca.id.clone(),
            subject: display_name(&cert.tbs_certificate.subject),
            issuer: display_name(&cert.tbs_certificate.issuer),
            cert_type: profile.cert_type(),
            key_algorithm: subject_key.public_key().algorithm(),
            not_before,
            not_after,
            certificate_pem: issued.pem.clone(),
            fingerprint: issued.fingerprint.clone(),
            status: CertificateStatus::Active,
            issued_by: actor.to_string(),
            wrapped_key,
            created_at: now,
        };
        self.store.insert_certificate(&record).await?;

        info!(
            ca_id = %ca.id,
            serial = %record.serial,
            subject = %record.subject,
            cert_type = %record.cert_type,
            "Certificate issued"
        );

        self.emit(
            AuditEvent::new(AuditAction::CertificateIssued, actor, now)
                .ca(&ca.id)
                .subject(&record.subject)
                .serial(&record.serial)
                .with("cert_type", record.cert_type)
                .with("not_after", not_after)
                .with("key_stored", record.wrapped_key.is_some()),
        )
        .await;

        Ok(IssuedCertificate {
            certificate_pem: issued.pem,
            certificate_der: issued.der,
            serial: issued.serial,
            fingerprint: issued.fingerprint,
            private_key_pem,
        })
    }

    /// Reserves a serial and signs a certificate with the CA key.
    ///
    /// The caller holds the CA lock. A serial reserved before a signing
    /// failure stays reserved and is never reused.
    pub(crate) async fn sign_for_ca(
        &self,
        ca: &CaConfig,
        profile: &CertificateProfile,
        subject: Name,
        subject_key: &PublicKey,
        not_before: u64,
        not_after: u64,
    ) -> Result<SignedCertificate> {
        let ca_pem = ca
            .certificate_pem
            .as_deref()
            .ok_or_else(|| PkiError::CaNotActive {
                ca_id: ca.id.clone(),
                status: ca.status,
            })?;
        let ca_cert = parse_certificate(ca_pem.as_bytes())?;
        let ca_key = x509::public_key_of(&ca_cert)?;

        let issuer = IssuerContext {
            public_key: &ca_key,
            crl_url: ca.crl_url.as_deref(),
            ocsp_url: ca.ocsp_url.as_deref(),
        };
        let extensions = build_extensions(profile, subject_key, &issuer)?;
        let (serial, serial_number) = self.allocate_serial(&ca.id).await?;

        let tbs = tbs_certificate(TbsParams {
            serial: serial_number,
            scheme: ca.key_algorithm.signature_scheme(),
            issuer: ca_cert.tbs_certificate.subject.clone(),
            subject,
            subject_public_key: x509::spki_of(subject_key)?,
            not_before,
            not_after,
            extensions,
        })?;

        let cipher = self.cipher();
        let certificate = with_signing_key(&cipher, &ca.wrapped_key, |key| {
            sign_certificate(tbs, key)
        })
        .inspect_err(|e| warn!(ca_id = %ca.id, serial = %serial, error = %e, "Signing failed"))?;

        SignedCertificate::new(certificate, serial)
    }

    /// Draws random serials until one can be reserved.
    ///
    /// Fails with [`PkiError::SerialExhaustion`] after
    /// `serial_retry_limit` collisions.
    pub(crate) async fn allocate_serial(&self, ca_id: &str) -> Result<(String, SerialNumber)> {
        let attempts = self.config.serial_retry_limit.max(1);
        for attempt in 1..=attempts {
            let serial_number = SerialNumber::new(&generate_serial())?;
            let serial = serial_hex(&serial_number);
            if self.store.reserve_serial(&serial, ca_id).await? {
                debug!(ca_id = %ca_id, serial = %serial, attempt, "Serial reserved");
                return Ok((serial, serial_number));
            }
        }

        warn!(ca_id = %ca_id, attempts, "Serial number space exhausted");
        Err(PkiError::SerialExhaustion {
            ca_id: ca_id.to_string(),
            attempts,
        })
    }
}

/// A signed certificate with its encodings.
pub(crate) struct SignedCertificate {
    pub certificate: Certificate,
    pub der: Vec<u8>,
    pub pem: String,
    pub serial: String,
    pub fingerprint: String,
}

impl SignedCertificate {
    fn new(certificate: Certificate, serial: String) -> Result<Self> {
        let der = certificate.to_der()?;
        Ok(Self {
            pem: certificate_pem(&certificate)?,
            fingerprint: fingerprint(&der),
            certificate,
            der,
            serial,
        })
    }
}
