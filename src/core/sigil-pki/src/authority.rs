//! CA lifecycle: creation, activation, suspension and key rotation.
//!
//! ```text
//! create_ca ──► INITIALIZING ──self_sign_ca / activate_ca──► ACTIVE ◄──┐
//!                                                              │        │
//!                                                         suspend_ca  reactivate_ca
//!                                                              ▼        │
//!                                                          SUSPENDED ───┘
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::Certificate;

use sigil_crypto::{KeyAlgorithm, PublicKey, WrappingKey};

use crate::audit::{AuditAction, AuditEvent};
use crate::csr::{generate_csr, RequestedExtensions};
use crate::engine::PkiEngine;
use crate::envelope::EnvelopeCipher;
use crate::error::{FieldViolation, PkiError, Result, Violations};
use crate::extensions::{build_extensions, IssuerContext};
use crate::issuance::{
    check_key_strength, tbs_certificate, validity_window, IssueRequest, TbsParams,
    DEFAULT_KEY_ALGORITHM,
};
use crate::keygen;
use crate::name::{display_name, DistinguishedName};
use crate::profile::{CertificateProfile, PolicyOptions};
use crate::signing::{sign_certificate, verify_certificate, with_signing_key};
use crate::types::{CaConfig, CaStatus, CertificateStatus, CertificateType, RevocationReason};
use crate::x509::{self, certificate_extension, parse_certificate, public_key_of};

const SECONDS_PER_DAY: u64 = 86_400;

/// A request to create a CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCaRequest {
    /// Identifier (`[a-z0-9_-]+`, at most 64 characters).
    pub id: String,
    /// Subject DN.
    pub subject_dn: String,
    /// Key algorithm; ECDSA P-256 when absent.
    pub key_algorithm: Option<KeyAlgorithm>,
    /// CRL distribution point put into issued certificates.
    pub crl_url: Option<String>,
    /// OCSP responder put into issued certificates.
    pub ocsp_url: Option<String>,
}

impl CreateCaRequest {
    /// Request with the default key algorithm and no URLs.
    pub fn new(id: impl Into<String>, subject_dn: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject_dn: subject_dn.into(),
            key_algorithm: None,
            crl_url: None,
            ocsp_url: None,
        }
    }
}

/// Outcome of a wrapping key rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Id of the new wrapping key.
    pub key_id: String,
    /// CA keys re-wrapped.
    pub cas_rewrapped: usize,
    /// Stored leaf keys re-wrapped.
    pub certificates_rewrapped: usize,
}

fn validate_ca_id(violations: &mut Violations, id: &str) {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    violations.check(!valid, "id", || "must match [a-z0-9_-]{1,64}".into());
}

fn validate_url(violations: &mut Violations, field: &str, url: Option<&str>) {
    if let Some(url) = url {
        let valid = (url.starts_with("http://") || url.starts_with("https://")) && url.is_ascii();
        violations.check(!valid, field, || format!("'{url}' is not an http(s) URL"));
    }
}

/// Checks that `cert` can serve as the certificate of `ca` at `now`.
///
/// `chain` holds the issuers above `cert`, nearest first; an empty chain
/// means `cert` must be self-signed.
fn check_ca_certificate(
    ca: &CaConfig,
    cert: &Certificate,
    chain: &[Certificate],
    now: u64,
) -> Vec<FieldViolation> {
    let mut violations = Violations::default();

    let ca_key = PublicKey::from_spki_pem(&ca.public_key_pem).ok();
    match public_key_of(cert) {
        Ok(key) => violations.check(
            ca_key.map(|k| k.spki_der().to_vec()).as_deref() != Some(key.spki_der()),
            "certificate",
            || "public key does not match the CA key".into(),
        ),
        Err(e) => violations.push("certificate", e.to_string()),
    }

    let expected = DistinguishedName::parse(&ca.subject).ok();
    let actual = DistinguishedName::from_name(&cert.tbs_certificate.subject).ok();
    violations.check(expected.is_none() || expected != actual, "certificate", || {
        format!(
            "subject '{}' does not match '{}'",
            display_name(&cert.tbs_certificate.subject),
            ca.subject
        )
    });

    let not_before = x509::from_time(&cert.tbs_certificate.validity.not_before);
    let not_after = x509::from_time(&cert.tbs_certificate.validity.not_after);
    violations.check(now < not_before || now > not_after, "certificate", || {
        "certificate is not currently valid".into()
    });

    match certificate_extension::<BasicConstraints>(cert) {
        Ok(Some((_, bc))) if bc.ca => {},
        _ => violations.push("certificate", "basicConstraints cA is not set"),
    }
    match certificate_extension::<KeyUsage>(cert) {
        Ok(Some((_, ku))) if ku.0.contains(KeyUsages::KeyCertSign) => {},
        _ => violations.push("certificate", "keyUsage lacks keyCertSign"),
    }

    let issuer = chain.first().unwrap_or(cert);
    match public_key_of(issuer) {
        Ok(issuer_key) => {
            if let Err(reason) = verify_certificate(cert, &issuer_key) {
                violations.push("chain", format!("certificate signature: {reason}"));
            }
        },
        Err(e) => violations.push("chain", e.to_string()),
    }
    if chain.is_empty() {
        violations.check(
            cert.tbs_certificate.issuer != cert.tbs_certificate.subject,
            "chain",
            || "issuer chain required for a certificate that is not self-signed".into(),
        );
    }
    for (index, pair) in chain.windows(2).enumerate() {
        let verified = public_key_of(&pair[1])
            .map_err(|e| e.to_string())
            .and_then(|key| verify_certificate(&pair[0], &key));
        if let Err(reason) = verified {
            violations.push(format!("chain[{index}]"), reason);
        }
    }

    violations.into_vec()
}

fn parse_chain(chain_pem: &[String]) -> Result<Vec<Certificate>> {
    chain_pem
        .iter()
        .map(|pem| parse_certificate(pem.as_bytes()))
        .collect()
}

fn transition(ca: &CaConfig, to: CaStatus) -> PkiError {
    PkiError::InvalidTransition {
        entity: ca.id.clone(),
        from: ca.status.to_string(),
        to: to.to_string(),
    }
}

impl PkiEngine {
    /// Creates a CA in `INITIALIZING`: key pair, wrapped private key and CSR.
    pub async fn create_ca(&self, request: CreateCaRequest, actor: &str) -> Result<CaConfig> {
        let mut violations = Violations::default();
        validate_ca_id(&mut violations, &request.id);
        if let Err(e) = DistinguishedName::parse(&request.subject_dn) {
            violations.push("subject_dn", e.to_string());
        }
        let algorithm = request.key_algorithm.unwrap_or(DEFAULT_KEY_ALGORITHM);
        check_key_strength(&mut violations, "key_algorithm", algorithm, self.config.min_rsa_bits);
        validate_url(&mut violations, "crl_url", request.crl_url.as_deref());
        validate_url(&mut violations, "ocsp_url", request.ocsp_url.as_deref());
        violations.into_result()?;

        let _rotation = self.rotation.read().await;
        let lock = self.ca_lock(&request.id);
        let _guard = lock.lock().await;

        if self.store.get_ca(&request.id).await?.is_some() {
            return Err(PkiError::CaAlreadyExists(request.id));
        }

        debug!(ca_id = %request.id, algorithm = %algorithm, "Generating CA key pair");
        let key_pair = keygen::generate(algorithm)?;
        let csr = generate_csr(
            &request.subject_dn,
            &key_pair,
            &RequestedExtensions {
                key_usage: Some(CertificateType::Ca),
                ..Default::default()
            },
        )?;

        let now = Self::now();
        let ca = CaConfig {
            id: request.id,
            subject: request.subject_dn,
            key_algorithm: algorithm,
            wrapped_key: self.cipher().wrap(key_pair.private_key().pkcs8_der())?,
            public_key_pem: key_pair.public_key().to_spki_pem()?,
            csr_pem: Some(csr.to_pem()?),
            status: CaStatus::Initializing,
            certificate_pem: None,
            chain_pem: Vec::new(),
            not_before: None,
            not_after: None,
            crl_url: request.crl_url,
            ocsp_url: request.ocsp_url,
            crl_number: 0,
            parent_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_ca(&ca).await?;

        info!(ca_id = %ca.id, subject = %ca.subject, algorithm = %algorithm, "CA created");
        self.emit(
            AuditEvent::new(AuditAction::CaCreated, actor, now)
                .ca(&ca.id)
                .subject(&ca.subject)
                .with("key_algorithm", algorithm),
        )
        .await;

        Ok(ca)
    }

    /// Makes an `INITIALIZING` CA a root by signing its own certificate.
    pub async fn self_sign_ca(
        &self,
        ca_id: &str,
        validity_days: u32,
        path_len: Option<u8>,
        actor: &str,
    ) -> Result<CaConfig> {
        let _rotation = self.rotation.read().await;
        let lock = self.ca_lock(ca_id);
        let _guard = lock.lock().await;

        let mut ca = self.store.require_ca(ca_id).await?;
        if ca.status != CaStatus::Initializing {
            return Err(transition(&ca, CaStatus::Active));
        }

        let max_days = self.config.max_validity_days;
        let mut violations = Violations::default();
        violations.check(
            validity_days == 0 || validity_days > max_days,
            "validity_days",
            || format!("must be between 1 and {max_days}, got {validity_days}"),
        );
        violations.into_result()?;

        let public_key = PublicKey::from_spki_pem(&ca.public_key_pem)?;
        let subject = DistinguishedName::parse(&ca.subject)?.to_name()?;
        let profile = CertificateProfile::ca(path_len, PolicyOptions::default())?;
        let extensions =
            build_extensions(&profile, &public_key, &IssuerContext::self_signed(&public_key))?;

        let now = Self::now();
        let not_after = now + u64::from(validity_days) * SECONDS_PER_DAY;
        let (serial, serial_number) = self.allocate_serial(&ca.id).await?;
        let tbs = tbs_certificate(TbsParams {
            serial: serial_number,
            scheme: ca.key_algorithm.signature_scheme(),
            issuer: subject.clone(),
            subject,
            subject_public_key: x509::spki_of(&public_key)?,
            not_before: now,
            not_after,
            extensions,
        })?;

        let cipher = self.cipher();
        let cert = with_signing_key(&cipher, &ca.wrapped_key, |key| sign_certificate(tbs, key))?;

        ca.certificate_pem = Some(x509::certificate_pem(&cert)?);
        ca.chain_pem = Vec::new();
        ca.not_before = Some(now);
        ca.not_after = Some(not_after);
        ca.csr_pem = None;
        ca.status = CaStatus::Active;
        ca.updated_at = now;
        self.store.put_ca(&ca).await?;

        info!(ca_id = %ca.id, serial = %serial, not_after, "Root CA self-signed");
        self.emit(
            AuditEvent::new(AuditAction::CaActivated, actor, now)
                .ca(&ca.id)
                .subject(&ca.subject)
                .serial(serial)
                .with("method", "self_signed"),
        )
        .await;

        Ok(ca)
    }

    /// Activates an `INITIALIZING` CA with a certificate signed elsewhere.
    ///
    /// `chain_pem` lists the issuers above the certificate, nearest first.
    pub async fn activate_ca(
        &self,
        ca_id: &str,
        certificate_pem: &str,
        chain_pem: &[String],
        actor: &str,
    ) -> Result<CaConfig> {
        let _rotation = self.rotation.read().await;
        let lock = self.ca_lock(ca_id);
        let _guard = lock.lock().await;

        let mut ca = self.store.require_ca(ca_id).await?;
        if ca.status != CaStatus::Initializing {
            return Err(transition(&ca, CaStatus::Active));
        }

        let cert = parse_certificate(certificate_pem.as_bytes())?;
        let chain = parse_chain(chain_pem)?;
        let now = Self::now();

        let violations = check_ca_certificate(&ca, &cert, &chain, now);
        if !violations.is_empty() {
            return Err(PkiError::Validation(violations));
        }

        ca.certificate_pem = Some(x509::certificate_pem(&cert)?);
        ca.chain_pem = chain
            .iter()
            .map(x509::certificate_pem)
            .collect::<Result<Vec<_>>>()?;
        ca.not_before = Some(x509::from_time(&cert.tbs_certificate.validity.not_before));
        ca.not_after = Some(x509::from_time(&cert.tbs_certificate.validity.not_after));
        ca.csr_pem = None;
        ca.status = CaStatus::Active;
        ca.updated_at = now;
        self.store.put_ca(&ca).await?;

        info!(ca_id = %ca.id, chain_length = ca.chain_pem.len(), "CA activated");
        self.emit(
            AuditEvent::new(AuditAction::CaActivated, actor, now)
                .ca(&ca.id)
                .subject(&ca.subject)
                .serial(x509::serial_hex(&cert.tbs_certificate.serial_number))
                .with("method", "uploaded"),
        )
        .await;

        Ok(ca)
    }

    /// Creates a CA and has `parent_id` sign it.
    ///
    /// The intermediate certificate is recorded as a `CA` certificate of the
    /// parent, so the parent can revoke it. If signing or activation fails the
    /// new CA is removed again and its certificate, if any, revoked, so the
    /// same id can be retried.
    pub async fn create_intermediate_ca(
        &self,
        parent_id: &str,
        request: CreateCaRequest,
        validity_days: u32,
        path_len: Option<u8>,
        actor: &str,
    ) -> Result<CaConfig> {
        let parent = self.store.require_ca(parent_id).await?;
        if !parent.can_sign() {
            return Err(PkiError::CaNotActive {
                ca_id: parent.id,
                status: parent.status,
            });
        }

        let mut violations = Violations::default();
        validity_window(
            &mut violations,
            validity_days,
            self.config.max_validity_days,
            parent.not_after,
            Self::now(),
        );
        violations.into_result()?;
        let profile = CertificateProfile::ca(path_len, PolicyOptions::default())?;

        let child = self.create_ca(request, actor).await?;
        let csr_pem = child
            .csr_pem
            .clone()
            .ok_or_else(|| PkiError::CsrConstruction(format!("CA '{}' has no CSR", child.id)))?;

        let issued = match self
            .issue(
                IssueRequest {
                    ca_id: parent.id.clone(),
                    subject_dn: Some(child.subject.clone()),
                    profile,
                    validity_days,
                    csr_pem: Some(csr_pem),
                    key_algorithm: None,
                    store_private_key: false,
                },
                actor,
            )
            .await
        {
            Ok(issued) => issued,
            Err(e) => {
                self.discard_initializing_ca(&child.id).await;
                return Err(e);
            },
        };

        let mut chain = Vec::with_capacity(parent.chain_pem.len() + 1);
        if let Some(pem) = &parent.certificate_pem {
            chain.push(pem.clone());
        }
        chain.extend(parent.chain_pem.iter().cloned());

        if let Err(e) = self
            .activate_ca(&child.id, &issued.certificate_pem, &chain, actor)
            .await
        {
            if let Err(revoke_error) = self
                .revoke(&issued.serial, RevocationReason::CessationOfOperation, actor)
                .await
            {
                warn!(
                    ca_id = %child.id,
                    serial = %issued.serial,
                    error = %revoke_error,
                    "Failed to revoke certificate of abandoned intermediate CA"
                );
            }
            self.discard_initializing_ca(&child.id).await;
            return Err(e);
        }

        let _rotation = self.rotation.read().await;
        let lock = self.ca_lock(&child.id);
        let _guard = lock.lock().await;
        let mut child = self.store.require_ca(&child.id).await?;
        child.parent_id = Some(parent.id);
        self.store.put_ca(&child).await?;

        Ok(child)
    }

    /// Deletes a CA that is still `INITIALIZING`. Failures are logged only.
    async fn discard_initializing_ca(&self, ca_id: &str) {
        let _rotation = self.rotation.read().await;
        let lock = self.ca_lock(ca_id);
        let _guard = lock.lock().await;

        let result = match self.store.get_ca(ca_id).await {
            Ok(Some(ca)) if ca.status == CaStatus::Initializing => {
                self.store.delete_ca(ca_id).await
            },
            Ok(_) => return,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => warn!(ca_id, "Removed intermediate CA after failed signing"),
            Err(e) => warn!(ca_id, error = %e, "Failed to remove intermediate CA"),
        }
    }

    /// `ACTIVE -> SUSPENDED`. A suspended CA signs nothing.
    pub async fn suspend_ca(&self, ca_id: &str, actor: &str) -> Result<CaConfig> {
        let lock = self.ca_lock(ca_id);
        let _guard = lock.lock().await;

        let mut ca = self.store.require_ca(ca_id).await?;
        if ca.status != CaStatus::Active {
            return Err(transition(&ca, CaStatus::Suspended));
        }

        let now = Self::now();
        ca.status = CaStatus::Suspended;
        ca.updated_at = now;
        self.store.put_ca(&ca).await?;

        info!(ca_id = %ca.id, "CA suspended");
        self.emit(AuditEvent::new(AuditAction::CaSuspended, actor, now).ca(&ca.id))
            .await;

        Ok(ca)
    }

    /// `SUSPENDED -> ACTIVE`, only if the stored certificate still checks
    /// out: key match, CA constraints, validity window and chain signatures.
    pub async fn reactivate_ca(&self, ca_id: &str, actor: &str) -> Result<CaConfig> {
        let lock = self.ca_lock(ca_id);
        let _guard = lock.lock().await;

        let mut ca = self.store.require_ca(ca_id).await?;
        if ca.status != CaStatus::Suspended {
            return Err(transition(&ca, CaStatus::Active));
        }

        let pem = ca
            .certificate_pem
            .as_deref()
            .ok_or_else(|| PkiError::InvalidCertificate(format!("CA '{ca_id}' has no certificate")))?;
        let cert = parse_certificate(pem.as_bytes())?;
        let chain = parse_chain(&ca.chain_pem)?;
        let now = Self::now();

        let violations = check_ca_certificate(&ca, &cert, &chain, now);
        if !violations.is_empty() {
            return Err(PkiError::Validation(violations));
        }

        ca.status = CaStatus::Active;
        ca.updated_at = now;
        self.store.put_ca(&ca).await?;

        info!(ca_id = %ca.id, "CA reactivated");
        self.emit(AuditEvent::new(AuditAction::CaReactivated, actor, now).ca(&ca.id))
            .await;

        Ok(ca)
    }

    /// Persists `ACTIVE -> EXPIRED` for certificates past their `notAfter`.
    ///
    /// Returns how many records changed. Reads apply expiry on the fly, so
    /// this only brings stored status in line.
    pub async fn refresh_expired(&self, ca_id: &str) -> Result<usize> {
        let lock = self.ca_lock(ca_id);
        let _guard = lock.lock().await;

        self.store.require_ca(ca_id).await?;
        let now = Self::now();
        let mut changed = 0;

        for mut record in self.store.list_certificates(ca_id).await? {
            if record.effective_status(now) == CertificateStatus::Expired
                && record.status.can_transition_to(CertificateStatus::Expired)
            {
                record.status = CertificateStatus::Expired;
                self.store.put_certificate(&record).await?;
                changed += 1;
            }
        }

        if changed > 0 {
            info!(ca_id = %ca_id, changed, "Expired certificates updated");
        }
        Ok(changed)
    }

    /// Re-wraps every stored private key under `new_key`.
    ///
    /// Nothing is re-signed. Until the rotation completes both keys are
    /// loaded; if it fails halfway, records wrapped with either key remain
    /// readable and the rotation can be run again.
    pub async fn rotate_wrapping_key(
        &self,
        new_key: &WrappingKey,
        actor: &str,
    ) -> Result<RotationReport> {
        let _rotation = self.rotation.write().await;

        let rotating = self.cipher().rotated(new_key)?;
        let key_id = rotating.key_id().to_string();
        self.set_cipher(rotating);
        let cipher = self.cipher();

        let mut report = RotationReport {
            key_id: key_id.clone(),
            cas_rewrapped: 0,
            certificates_rewrapped: 0,
        };

        for ca in self.store.list_cas().await? {
            let lock = self.ca_lock(&ca.id);
            let _guard = lock.lock().await;

            let mut ca = self.store.require_ca(&ca.id).await?;
            if cipher.needs_rewrap(&ca.wrapped_key) {
                ca.wrapped_key = cipher.rewrap(&ca.wrapped_key)?;
                ca.updated_at = Self::now();
                self.store.put_ca(&ca).await?;
                report.cas_rewrapped += 1;
            }

            for mut record in self.store.list_certificates(&ca.id).await? {
                let Some(wrapped) = &record.wrapped_key else {
                    continue;
                };
                if cipher.needs_rewrap(wrapped) {
                    record.wrapped_key = Some(cipher.rewrap(wrapped)?);
                    self.store.put_certificate(&record).await?;
                    report.certificates_rewrapped += 1;
                }
            }
        }

        self.set_cipher(EnvelopeCipher::new(new_key)?);

        info!(
            key_id = %key_id,
            cas = report.cas_rewrapped,
            certificates = report.certificates_rewrapped,
            "Wrapping key rotated"
        );
        self.emit(
            AuditEvent::new(AuditAction::WrappingKeyRotated, actor, Self::now())
                .with("key_id", &key_id)
                .with("cas_rewrapped", report.cas_rewrapped)
                .with("certificates_rewrapped", report.certificates_rewrapped),
        )
        .await;

        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use std::sync::Arc;

    use sigil_crypto::EcCurve;
    use sigil_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::config::PkiConfig;
    use crate::csr::parse_and_verify;
    use crate::profile::CertificateProfile;
    use crate::test_support::{issue_server, root_ca, setup, setup_with, ConflictingBackend, ACTOR};

    #[tokio::test]
    async fn test_create_ca_starts_initializing_with_csr() {
        let (engine, audit) = setup();
        let ca = engine
            .create_ca(CreateCaRequest::new("root", "CN=Root CA,O=Sigil,C=FR"), ACTOR)
            .await
            .unwrap();

        assert_eq!(ca.status, CaStatus::Initializing);
        assert_eq!(ca.key_algorithm, DEFAULT_KEY_ALGORITHM);
        assert!(ca.certificate_pem.is_none());
        assert!(!ca.can_sign());
        assert_eq!(ca.wrapped_key.key_id, engine.wrapping_key_id());

        let csr = parse_and_verify(ca.csr_pem.as_deref().unwrap().as_bytes()).unwrap();
        let public_key = PublicKey::from_spki_pem(&ca.public_key_pem).unwrap();
        assert_eq!(csr.public_key.spki_der(), public_key.spki_der());
        assert_eq!(display_name(&csr.subject), "CN=Root CA, O=Sigil, C=FR");

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::CaCreated);
        assert_eq!(events[0].ca_id.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn test_duplicate_ca_is_rejected() {
        let (engine, _audit) = setup();
        engine
            .create_ca(CreateCaRequest::new("root", "CN=Root"), ACTOR)
            .await
            .unwrap();
        let result = engine
            .create_ca(CreateCaRequest::new("root", "CN=Other"), ACTOR)
            .await;
        assert!(matches!(result, Err(PkiError::CaAlreadyExists(ref id)) if id == "root"));
    }

    #[tokio::test]
    async fn test_create_ca_reports_every_bad_field() {
        let (engine, _audit) = setup();
        let request = CreateCaRequest {
            key_algorithm: Some(KeyAlgorithm::Rsa { bits: 1024 }),
            crl_url: Some("ftp://crl.example.com/root.crl".into()),
            ..CreateCaRequest::new("Bad ID", "CN=")
        };

        match engine.create_ca(request, ACTOR).await {
            Err(PkiError::Validation(violations)) => {
                let fields: Vec<_> = violations.iter().map(|v| v.field.as_str()).collect();
                assert_eq!(fields, vec!["id", "subject_dn", "key_algorithm", "crl_url"]);
            },
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(engine.list_cas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_signed_root_is_active_ca() {
        let (engine, _audit) = setup();
        let ca = root_ca(&engine, "root", Some(2)).await;

        assert_eq!(ca.status, CaStatus::Active);
        assert!(ca.csr_pem.is_none());
        assert!(ca.chain_pem.is_empty());

        let cert = parse_certificate(ca.certificate_pem.as_deref().unwrap().as_bytes()).unwrap();
        verify_certificate(&cert, &public_key_of(&cert).unwrap()).unwrap();
        assert_eq!(cert.tbs_certificate.issuer, cert.tbs_certificate.subject);

        let (critical, bc) = certificate_extension::<BasicConstraints>(&cert).unwrap().unwrap();
        assert!(critical);
        assert!(bc.ca);
        assert_eq!(bc.path_len_constraint, Some(2));
        assert_eq!(ca.not_after, Some(x509::from_time(&cert.tbs_certificate.validity.not_after)));

        let again = engine.self_sign_ca("root", 365, None, ACTOR).await;
        assert!(matches!(again, Err(PkiError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_every_key_type_can_run_a_ca() {
        let (engine, _audit) = setup();
        let algorithms = [
            ("p384", KeyAlgorithm::Ecdsa { curve: EcCurve::P384 }),
            ("ed25519", KeyAlgorithm::Ed25519),
        ];

        for (id, algorithm) in algorithms {
            let request = CreateCaRequest {
                key_algorithm: Some(algorithm),
                ..CreateCaRequest::new(id, format!("CN={id} CA"))
            };
            engine.create_ca(request, ACTOR).await.unwrap();
            engine.self_sign_ca(id, 365, None, ACTOR).await.unwrap();

            let issued = issue_server(&engine, id, "www.example.com").await;
            let cert = parse_certificate(&issued.certificate_der).unwrap();
            let ca = engine.get_ca(id).await.unwrap();
            let ca_cert =
                parse_certificate(ca.certificate_pem.as_deref().unwrap().as_bytes()).unwrap();
            verify_certificate(&cert, &public_key_of(&ca_cert).unwrap()).unwrap();
            assert_eq!(
                cert.signature_algorithm.oid,
                algorithm.signature_scheme().oid()
            );
        }
    }

    #[tokio::test]
    async fn test_activate_rejects_foreign_certificate() {
        let (engine, _audit) = setup();
        let root = root_ca(&engine, "root", None).await;
        engine
            .create_ca(CreateCaRequest::new("sub", "CN=Sub CA"), ACTOR)
            .await
            .unwrap();

        let result = engine
            .activate_ca("sub", root.certificate_pem.as_deref().unwrap(), &[], ACTOR)
            .await;

        match result {
            Err(PkiError::Validation(violations)) => {
                assert!(violations
                    .iter()
                    .any(|v| v.message.contains("does not match the CA key")));
                assert!(violations.iter().any(|v| v.message.contains("subject")));
            },
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(
            engine.get_ca("sub").await.unwrap().status,
            CaStatus::Initializing
        );
    }

    #[tokio::test]
    async fn test_activate_with_externally_signed_certificate() {
        let (engine, _audit) = setup();
        let root = root_ca(&engine, "root", None).await;
        let sub = engine
            .create_ca(CreateCaRequest::new("sub", "CN=Sub CA"), ACTOR)
            .await
            .unwrap();

        let issued = engine
            .issue(
                IssueRequest {
                    subject_dn: None,
                    csr_pem: sub.csr_pem.clone(),
                    ..IssueRequest::new(
                        "root",
                        "",
                        CertificateProfile::ca(Some(0), PolicyOptions::default()).unwrap(),
                    )
                },
                ACTOR,
            )
            .await
            .unwrap();

        let missing_chain = engine
            .activate_ca("sub", &issued.certificate_pem, &[], ACTOR)
            .await;
        assert!(matches!(missing_chain, Err(PkiError::Validation(_))));

        let chain = vec![root.certificate_pem.clone().unwrap()];
        let sub = engine
            .activate_ca("sub", &issued.certificate_pem, &chain, ACTOR)
            .await
            .unwrap();
        assert_eq!(sub.status, CaStatus::Active);
        assert_eq!(sub.chain_pem.len(), 1);
        assert!(sub.csr_pem.is_none());
    }

    #[tokio::test]
    async fn test_intermediate_is_recorded_under_parent() {
        let (engine, _audit) = setup();
        let root = root_ca(&engine, "root", None).await;
        let child = engine
            .create_intermediate_ca(
                "root",
                CreateCaRequest::new("issuing", "CN=Issuing CA"),
                1825,
                Some(0),
                ACTOR,
            )
            .await
            .unwrap();

        assert_eq!(child.status, CaStatus::Active);
        assert_eq!(child.parent_id.as_deref(), Some("root"));
        assert_eq!(child.chain_pem, vec![root.certificate_pem.clone().unwrap()]);

        let parent_records = engine.list_certificates("root").await.unwrap();
        assert_eq!(parent_records.len(), 1);
        assert_eq!(parent_records[0].cert_type, CertificateType::Ca);
        assert_eq!(parent_records[0].subject, "CN=Issuing CA");
    }

    #[tokio::test]
    async fn test_intermediate_needs_active_parent() {
        let (engine, _audit) = setup();
        engine
            .create_ca(CreateCaRequest::new("root", "CN=Root"), ACTOR)
            .await
            .unwrap();

        let result = engine
            .create_intermediate_ca(
                "root",
                CreateCaRequest::new("issuing", "CN=Issuing CA"),
                365,
                None,
                ACTOR,
            )
            .await;
        assert!(matches!(result, Err(PkiError::CaNotActive { .. })));
        assert!(engine.get_ca("issuing").await.is_err());
    }

    #[tokio::test]
    async fn test_intermediate_outliving_parent_leaves_nothing_behind() {
        let (engine, _audit) = setup();
        root_ca(&engine, "root", None).await;

        let result = engine
            .create_intermediate_ca(
                "root",
                CreateCaRequest::new("issuing", "CN=Issuing CA"),
                5000,
                None,
                ACTOR,
            )
            .await;
        assert!(matches!(result, Err(PkiError::Validation(_))));
        assert!(matches!(
            engine.get_ca("issuing").await,
            Err(PkiError::CaNotFound(_))
        ));

        let child = engine
            .create_intermediate_ca(
                "root",
                CreateCaRequest::new("issuing", "CN=Issuing CA"),
                1000,
                None,
                ACTOR,
            )
            .await
            .unwrap();
        assert_eq!(child.status, CaStatus::Active);
    }

    #[tokio::test]
    async fn test_intermediate_signing_failure_removes_child() {
        let config = PkiConfig {
            serial_retry_limit: 2,
            ..PkiConfig::default()
        };
        let backend = Arc::new(ConflictingBackend::new("serial/"));
        backend.set_armed(false);
        let (engine, _audit) = setup_with(backend.clone(), config);
        root_ca(&engine, "root", None).await;

        backend.set_armed(true);
        let result = engine
            .create_intermediate_ca(
                "root",
                CreateCaRequest::new("issuing", "CN=Issuing CA"),
                365,
                None,
                ACTOR,
            )
            .await;
        assert!(matches!(result, Err(PkiError::SerialExhaustion { .. })));
        assert!(matches!(
            engine.get_ca("issuing").await,
            Err(PkiError::CaNotFound(_))
        ));

        backend.set_armed(false);
        let child = engine
            .create_intermediate_ca(
                "root",
                CreateCaRequest::new("issuing", "CN=Issuing CA"),
                365,
                None,
                ACTOR,
            )
            .await
            .unwrap();
        assert_eq!(child.parent_id.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn test_signing_waits_for_wrapping_key_rotation() {
        let (engine, _audit) = setup();
        engine
            .create_ca(CreateCaRequest::new("root", "CN=Root"), ACTOR)
            .await
            .unwrap();

        let rotation = engine.rotation.write().await;
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            engine.self_sign_ca("root", 365, None, ACTOR),
        )
        .await;
        assert!(blocked.is_err());
        drop(rotation);

        let root = engine.self_sign_ca("root", 365, None, ACTOR).await.unwrap();
        assert_eq!(root.status, CaStatus::Active);
    }

    #[tokio::test]
    async fn test_suspend_and_reactivate() {
        let (engine, audit) = setup();
        root_ca(&engine, "root", None).await;

        let suspended = engine.suspend_ca("root", ACTOR).await.unwrap();
        assert_eq!(suspended.status, CaStatus::Suspended);

        let profile = CertificateProfile::server(&["www.example.com"]).unwrap();
        let blocked = engine
            .issue(IssueRequest::new("root", "CN=www.example.com", profile), ACTOR)
            .await;
        assert!(matches!(
            blocked,
            Err(PkiError::CaNotActive {
                status: CaStatus::Suspended,
                ..
            })
        ));
        assert!(matches!(
            engine.generate_crl("root", ACTOR).await,
            Err(PkiError::CaNotActive { .. })
        ));
        assert!(matches!(
            engine.suspend_ca("root", ACTOR).await,
            Err(PkiError::InvalidTransition { .. })
        ));

        let active = engine.reactivate_ca("root", ACTOR).await.unwrap();
        assert_eq!(active.status, CaStatus::Active);
        issue_server(&engine, "root", "www.example.com").await;

        assert!(matches!(
            engine.reactivate_ca("root", ACTOR).await,
            Err(PkiError::InvalidTransition { .. })
        ));

        let actions: Vec<_> = audit.events().iter().map(|e| e.action).collect();
        assert!(actions.contains(&AuditAction::CaSuspended));
        assert!(actions.contains(&AuditAction::CaReactivated));
    }

    #[tokio::test]
    async fn test_refresh_expired_leaves_current_certificates() {
        let (engine, _audit) = setup();
        root_ca(&engine, "root", None).await;
        issue_server(&engine, "root", "www.example.com").await;

        assert_eq!(engine.refresh_expired("root").await.unwrap(), 0);
        assert!(matches!(
            engine.refresh_expired("missing").await,
            Err(PkiError::CaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rotation_rewraps_every_key() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let old_key = WrappingKey::generate();
        let new_key = WrappingKey::generate();

        let engine = PkiEngine::new(backend.clone(), &old_key, PkiConfig::default()).unwrap();
        root_ca(&engine, "root", None).await;
        let request = IssueRequest {
            store_private_key: true,
            ..IssueRequest::new(
                "root",
                "CN=kept.example.com",
                CertificateProfile::server(&["kept.example.com"]).unwrap(),
            )
        };
        let kept = engine.issue(request, ACTOR).await.unwrap();
        issue_server(&engine, "root", "not-kept.example.com").await;

        let report = engine.rotate_wrapping_key(&new_key, ACTOR).await.unwrap();
        assert_eq!(report.cas_rewrapped, 1);
        assert_eq!(report.certificates_rewrapped, 1);
        assert_eq!(report.key_id, engine.wrapping_key_id());

        let again = engine.rotate_wrapping_key(&new_key, ACTOR).await.unwrap();
        assert_eq!(again.cas_rewrapped, 0);

        // Only the new key is needed from here on.
        let fresh = PkiEngine::new(backend, &new_key, PkiConfig::default()).unwrap();
        issue_server(&fresh, "root", "after.example.com").await;
        let record = fresh.get_certificate(&kept.serial).await.unwrap();
        fresh
            .cipher()
            .unwrap(record.wrapped_key.as_ref().unwrap())
            .unwrap();
    }
}
