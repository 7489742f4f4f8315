//! CRL generation and validation.
//!
//! Full and delta CRLs share one number sequence per CA. The number is
//! committed to the CA record before the CRL itself is stored, so a failure
//! in between skips a number instead of repeating one.

use der::asn1::{OctetString, Uint};
use der::{Decode, Encode};
use serde::Serialize;
use tracing::{debug, info};
use x509_cert::certificate::Version;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::pkix::crl::dp::IssuingDistributionPoint;
use x509_cert::ext::pkix::crl::CrlReason;
use x509_cert::ext::pkix::name::DistributionPointName;
use x509_cert::ext::pkix::{AuthorityKeyIdentifier, KeyUsage, KeyUsages, SubjectKeyIdentifier};
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::Certificate;

use sigil_crypto::digest::key_identifier;

use crate::audit::{AuditAction, AuditEvent};
use crate::engine::PkiEngine;
use crate::error::{PkiError, Result};
use crate::extensions::{authority_key_identifier, uri};
use crate::name::display_name;
use crate::signing::{sign_crl, verify_signature, with_signing_key};
use crate::types::{CaConfig, CrlRecord, RevocationReason, RevocationRecord};
use crate::x509::{
    self, certificate_extension, decode_extension, find_extension, make_extension,
    parse_certificate, public_key_of, serial_hex, CRL_LABEL, OID_AUTHORITY_KEY_ID,
    OID_CRL_NUMBER, OID_CRL_REASON, OID_DELTA_CRL_INDICATOR, OID_ISSUING_DISTRIBUTION_POINT,
};

const SECONDS_PER_HOUR: u64 = 3_600;

fn crl_reason(reason: RevocationReason) -> CrlReason {
    match reason {
        RevocationReason::KeyCompromise => CrlReason::KeyCompromise,
        RevocationReason::CaCompromise => CrlReason::CaCompromise,
        RevocationReason::AffiliationChanged => CrlReason::AffiliationChanged,
        RevocationReason::Superseded => CrlReason::Superseded,
        RevocationReason::CessationOfOperation => CrlReason::CessationOfOperation,
        RevocationReason::CertificateHold => CrlReason::CertificateHold,
        RevocationReason::RemoveFromCrl => CrlReason::RemoveFromCRL,
    }
}

/// Encodes a CRL number (`INTEGER (0..MAX)`) as an extension.
fn number_extension(oid: const_oid::ObjectIdentifier, number: u64, critical: bool) -> Result<Extension> {
    Ok(Extension {
        extn_id: oid,
        critical,
        extn_value: OctetString::new(Uint::new(&number.to_be_bytes())?.to_der()?)?,
    })
}

fn decode_number(extension: &Extension) -> std::result::Result<u64, String> {
    let value = Uint::from_der(extension.extn_value.as_bytes()).map_err(|e| e.to_string())?;
    let bytes = value.as_bytes();
    if bytes.len() > 8 {
        return Err("CRL number does not fit in 64 bits".into());
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Parses a CRL from PEM or DER.
pub fn parse_crl(input: &[u8]) -> Result<CertificateList> {
    let der = match std::str::from_utf8(input) {
        Ok(text) if text.contains("-----BEGIN") => x509::pem_blocks(text, CRL_LABEL)
            .map_err(|e| PkiError::InvalidCrl(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| PkiError::InvalidCrl(format!("no {CRL_LABEL} block")))?,
        _ => input.to_vec(),
    };
    CertificateList::from_der(&der).map_err(|e| PkiError::InvalidCrl(e.to_string()))
}

/// Encodes CRL DER as PEM.
pub fn crl_pem(der: &[u8]) -> Result<String> {
    x509::to_pem(CRL_LABEL, der)
}

/// What goes into one CRL.
struct CrlContents<'a> {
    number: u64,
    this_update: u64,
    next_update: u64,
    delta_of: Option<u64>,
    entries: Vec<&'a RevocationRecord>,
}

impl PkiEngine {
    /// Generates a full CRL listing every revocation of `ca_id` except
    /// `REMOVE_FROM_CRL` ones.
    pub async fn generate_crl(&self, ca_id: &str, actor: &str) -> Result<CrlRecord> {
        let _rotation = self.rotation.read().await;
        let lock = self.ca_lock(ca_id);
        let _guard = lock.lock().await;

        let ca = self.signing_ca(ca_id).await?;
        let revocations = self.store.list_revocations(ca_id).await?;
        let now = Self::now();

        let contents = CrlContents {
            number: ca.crl_number + 1,
            this_update: now,
            next_update: now + u64::from(self.config.crl_validity_hours) * SECONDS_PER_HOUR,
            delta_of: None,
            entries: revocations
                .iter()
                .filter(|r| r.reason.appears_on_crl())
                .collect(),
        };

        let record = self.publish_crl(ca, contents).await?;

        info!(ca_id = %ca_id, number = record.number, entries = record.entry_count(), "CRL generated");
        self.emit(
            AuditEvent::new(AuditAction::CrlGenerated, actor, now)
                .ca(ca_id)
                .subject(&record.issuer)
                .with("crl_number", record.number)
                .with("entries", record.entry_count()),
        )
        .await;

        Ok(record)
    }

    /// Generates a delta CRL over the most recent full CRL.
    ///
    /// Lists revocations made at or after the base CRL's thisUpdate that the
    /// base does not already list. Fails with [`PkiError::NoBaseCrl`] before
    /// the first full CRL.
    pub async fn generate_delta_crl(&self, ca_id: &str, actor: &str) -> Result<CrlRecord> {
        let _rotation = self.rotation.read().await;
        let lock = self.ca_lock(ca_id);
        let _guard = lock.lock().await;

        let ca = self.signing_ca(ca_id).await?;
        let base = self
            .store
            .latest_full_crl(ca_id)
            .await?
            .ok_or_else(|| PkiError::NoBaseCrl(ca_id.to_string()))?;
        let revocations = self.store.list_revocations(ca_id).await?;
        let now = Self::now();

        let contents = CrlContents {
            number: ca.crl_number + 1,
            this_update: now,
            next_update: now + u64::from(self.config.delta_crl_validity_hours) * SECONDS_PER_HOUR,
            delta_of: Some(base.number),
            entries: revocations
                .iter()
                .filter(|r| r.reason.appears_on_crl())
                .filter(|r| r.revoked_at >= base.this_update)
                .filter(|r| !base.entries.contains(&r.serial))
                .collect(),
        };

        let record = self.publish_crl(ca, contents).await?;

        info!(
            ca_id = %ca_id,
            number = record.number,
            base = base.number,
            entries = record.entry_count(),
            "Delta CRL generated"
        );
        self.emit(
            AuditEvent::new(AuditAction::DeltaCrlGenerated, actor, now)
                .ca(ca_id)
                .subject(&record.issuer)
                .with("crl_number", record.number)
                .with("base_crl_number", base.number)
                .with("entries", record.entry_count()),
        )
        .await;

        Ok(record)
    }

    /// Validates a CRL against the certificate of `ca_id`.
    pub async fn validate_crl(&self, ca_id: &str, crl: &[u8]) -> Result<CrlValidation> {
        let ca = self.store.require_ca(ca_id).await?;
        let pem = ca.certificate_pem.as_deref().ok_or_else(|| PkiError::CaNotActive {
            ca_id: ca.id.clone(),
            status: ca.status,
        })?;
        let issuer = parse_certificate(pem.as_bytes())?;
        validate_crl(crl, &issuer, Self::now())
    }

    async fn signing_ca(&self, ca_id: &str) -> Result<CaConfig> {
        let ca = self.store.require_ca(ca_id).await?;
        if !ca.can_sign() {
            return Err(PkiError::CaNotActive {
                ca_id: ca.id,
                status: ca.status,
            });
        }
        Ok(ca)
    }

    /// Signs a CRL, advances the CA's CRL number and stores the CRL.
    /// The caller holds the CA lock.
    async fn publish_crl(&self, mut ca: CaConfig, contents: CrlContents<'_>) -> Result<CrlRecord> {
        let ca_pem = ca.certificate_pem.as_deref().ok_or_else(|| PkiError::CaNotActive {
            ca_id: ca.id.clone(),
            status: ca.status,
        })?;
        let ca_cert = parse_certificate(ca_pem.as_bytes())?;
        let ca_key = public_key_of(&ca_cert)?;

        let mut revoked = Vec::with_capacity(contents.entries.len());
        for entry in &contents.entries {
            let serial = hex::decode(&entry.serial)
                .map_err(|e| PkiError::InvalidCertificate(format!("serial {}: {e}", entry.serial)))?;
            revoked.push(RevokedCert {
                serial_number: SerialNumber::new(&serial)?,
                revocation_date: x509::to_time(entry.revoked_at)?,
                crl_entry_extensions: Some(vec![make_extension(&crl_reason(entry.reason), false)?]),
            });
        }

        let mut extensions = vec![
            make_extension(&authority_key_identifier(&ca_key)?, false)?,
            number_extension(OID_CRL_NUMBER, contents.number, false)?,
        ];
        if let Some(base) = contents.delta_of {
            extensions.push(number_extension(OID_DELTA_CRL_INDICATOR, base, true)?);
        }
        if let (true, Some(url)) = (self.config.include_issuing_distribution_point, &ca.crl_url) {
            let idp = IssuingDistributionPoint {
                distribution_point: Some(DistributionPointName::FullName(vec![uri(url)?])),
                only_contains_user_certs: false,
                only_contains_ca_certs: false,
                only_some_reasons: None,
                indirect_crl: false,
                only_contains_attribute_certs: false,
            };
            extensions.push(make_extension(&idp, true)?);
        }

        let tbs = TbsCertList {
            version: Version::V2,
            signature: x509::algorithm_identifier(ca.key_algorithm.signature_scheme()),
            issuer: ca_cert.tbs_certificate.subject.clone(),
            this_update: x509::to_time(contents.this_update)?,
            next_update: Some(x509::to_time(contents.next_update)?),
            revoked_certificates: (!revoked.is_empty()).then_some(revoked),
            crl_extensions: Some(extensions),
        };

        let cipher = self.cipher();
        let crl = with_signing_key(&cipher, &ca.wrapped_key, |key| sign_crl(tbs, key))?;
        let crl_der = crl.to_der()?;

        ca.crl_number = contents.number;
        ca.updated_at = contents.this_update;
        self.store.put_ca(&ca).await?;
        debug!(ca_id = %ca.id, crl_number = ca.crl_number, "CRL number advanced");

        let record = CrlRecord {
            ca_id: ca.id.clone(),
            number: contents.number,
            issuer: display_name(&ca_cert.tbs_certificate.subject),
            this_update: contents.this_update,
            next_update: contents.next_update,
            delta_of: contents.delta_of,
            entries: contents.entries.iter().map(|r| r.serial.clone()).collect(),
            crl_der,
        };
        self.store.insert_crl(&record).await?;

        Ok(record)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Result of [`validate_crl`]. Problems with the data are issues, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrlValidation {
    /// All checks passed.
    pub is_valid: bool,
    /// The signature verifies under the issuer key.
    pub signature_valid: bool,
    /// `thisUpdate <= now <= nextUpdate`.
    pub time_valid: bool,
    /// Required extensions present with the right criticality.
    pub extensions_valid: bool,
    /// The CRL issuer is the certificate's subject.
    pub issuer_matches: bool,
    /// Carries a deltaCRLIndicator.
    pub is_delta: bool,
    /// cRLNumber, if readable.
    pub crl_number: Option<u64>,
    /// Base CRL number of a delta CRL.
    pub base_crl_number: Option<u64>,
    /// Number of listed certificates.
    pub entry_count: usize,
    /// Serials listed, lowercase hex.
    pub revoked_serials: Vec<String>,
    /// Human-readable findings, in check order.
    pub issues: Vec<String>,
}

/// Validates `crl` (PEM or DER) against the issuer certificate at `now`.
///
/// Only undecodable input is an error. A stale CRL, a bad signature or a
/// missing extension is reported in [`CrlValidation::issues`].
pub fn validate_crl(crl: &[u8], issuer: &Certificate, now: u64) -> Result<CrlValidation> {
    let list = parse_crl(crl)?;
    let tbs = &list.tbs_cert_list;
    let mut issues = Vec::new();

    // Issuer
    let issuer_matches = tbs.issuer == issuer.tbs_certificate.subject;
    if !issuer_matches {
        issues.push(format!(
            "CRL issuer '{}' does not match certificate subject '{}'",
            display_name(&tbs.issuer),
            display_name(&issuer.tbs_certificate.subject)
        ));
    }
    match certificate_extension::<KeyUsage>(issuer) {
        Ok(Some((_, ku))) if !ku.0.contains(KeyUsages::CRLSign) => {
            issues.push("issuer certificate lacks the cRLSign key usage".into());
        },
        _ => {},
    }

    // Signature
    let issuer_key = public_key_of(issuer)?;
    let signature_valid = if list.signature_algorithm != tbs.signature {
        issues.push("outer and inner signature algorithms differ".into());
        false
    } else {
        match verify_signature(&issuer_key, &list.signature_algorithm, &tbs.to_der()?, &list.signature) {
            Ok(()) => true,
            Err(reason) => {
                issues.push(format!("signature does not verify: {reason}"));
                false
            },
        }
    };

    // Time
    let this_update = x509::from_time(&tbs.this_update);
    let mut time_valid = true;
    if now < this_update {
        time_valid = false;
        issues.push(format!("CRL is not yet valid (thisUpdate {this_update})"));
    }
    match tbs.next_update.as_ref().map(x509::from_time) {
        Some(next_update) if now > next_update => {
            time_valid = false;
            issues.push(format!(
                "CRL is stale: nextUpdate {next_update} passed {} seconds ago",
                now - next_update
            ));
        },
        Some(_) => {},
        None => {
            time_valid = false;
            issues.push("CRL has no nextUpdate".into());
        },
    }

    // Extensions
    let extensions = tbs.crl_extensions.as_ref();
    let mut extensions_valid = true;
    let mut problem = |message: String| {
        extensions_valid = false;
        issues.push(message);
    };

    if tbs.version != Version::V2 {
        problem("CRL with extensions must be version 2".into());
    }

    match find_extension(extensions, OID_AUTHORITY_KEY_ID) {
        None => problem("authorityKeyIdentifier is missing".into()),
        Some(ext) if ext.critical => problem("authorityKeyIdentifier must not be critical".into()),
        Some(ext) => {
            let expected = match certificate_extension::<SubjectKeyIdentifier>(issuer) {
                Ok(Some((_, ski))) => ski.0.as_bytes().to_vec(),
                _ => key_identifier(issuer_key.subject_public_key()),
            };
            let actual = decode_extension::<AuthorityKeyIdentifier>(ext)
                .ok()
                .and_then(|aki| aki.key_identifier)
                .map(|id| id.as_bytes().to_vec());
            if actual.as_deref() != Some(expected.as_slice()) {
                problem("authorityKeyIdentifier does not match the issuer key".into());
            }
        },
    }

    let crl_number = match find_extension(extensions, OID_CRL_NUMBER) {
        None => {
            problem("cRLNumber is missing".into());
            None
        },
        Some(ext) => {
            if ext.critical {
                problem("cRLNumber must not be critical".into());
            }
            decode_number(ext)
                .map_err(|reason| problem(format!("cRLNumber: {reason}")))
                .ok()
        },
    };

    let base_crl_number = match find_extension(extensions, OID_DELTA_CRL_INDICATOR) {
        None => None,
        Some(ext) => {
            if !ext.critical {
                problem("deltaCRLIndicator must be critical".into());
            }
            decode_number(ext)
                .map_err(|reason| problem(format!("deltaCRLIndicator: {reason}")))
                .ok()
        },
    };
    if let (Some(number), Some(base)) = (crl_number, base_crl_number) {
        if base >= number {
            problem(format!("delta CRL {number} references base {base}, which is not lower"));
        }
    }

    if let Some(ext) = find_extension(extensions, OID_ISSUING_DISTRIBUTION_POINT) {
        if !ext.critical {
            problem("issuingDistributionPoint must be critical".into());
        }
    }

    const KNOWN: [const_oid::ObjectIdentifier; 4] = [
        OID_AUTHORITY_KEY_ID,
        OID_CRL_NUMBER,
        OID_DELTA_CRL_INDICATOR,
        OID_ISSUING_DISTRIBUTION_POINT,
    ];
    for ext in extensions.into_iter().flatten() {
        if ext.critical && !KNOWN.contains(&ext.extn_id) {
            problem(format!("unrecognized critical CRL extension {}", ext.extn_id));
        }
    }

    let revoked = tbs.revoked_certificates.as_deref().unwrap_or_default();
    for entry in revoked {
        for ext in entry.crl_entry_extensions.iter().flatten() {
            if ext.extn_id == OID_CRL_REASON {
                if ext.critical {
                    problem(format!(
                        "reasonCode of {} must not be critical",
                        serial_hex(&entry.serial_number)
                    ));
                }
            } else if ext.critical {
                problem(format!(
                    "unrecognized critical entry extension {} on {}",
                    ext.extn_id,
                    serial_hex(&entry.serial_number)
                ));
            }
        }
    }

    Ok(CrlValidation {
        is_valid: signature_valid && time_valid && extensions_valid && issuer_matches,
        signature_valid,
        time_valid,
        extensions_valid,
        issuer_matches,
        is_delta: base_crl_number.is_some(),
        crl_number,
        base_crl_number,
        entry_count: revoked.len(),
        revoked_serials: revoked.iter().map(|e| serial_hex(&e.serial_number)).collect(),
        issues,
    })
}
