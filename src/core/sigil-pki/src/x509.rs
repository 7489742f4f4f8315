//! Shared X.509 plumbing: times, extensions, PEM and OIDs.

use std::time::Duration;

use const_oid::{AssociatedOid, ObjectIdentifier};
use der::asn1::{GeneralizedTime, OctetString, UtcTime};
use der::pem::LineEnding;
use der::{Decode, Encode};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Time;
use x509_cert::Certificate;

use sigil_crypto::{PublicKey, SignatureScheme};

use crate::error::{PkiError, Result};

/// PEM label of certificates.
pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";
/// PEM label of CRLs.
pub const CRL_LABEL: &str = "X509 CRL";
/// PEM label of PKCS#10 requests.
pub const CSR_LABEL: &str = "CERTIFICATE REQUEST";

pub(crate) const OID_SUBJECT_KEY_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.14");
pub(crate) const OID_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
pub(crate) const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
pub(crate) const OID_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");
pub(crate) const OID_CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");
pub(crate) const OID_CRL_REASON: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.21");
pub(crate) const OID_DELTA_CRL_INDICATOR: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.27");
pub(crate) const OID_ISSUING_DISTRIBUTION_POINT: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.28");
pub(crate) const OID_NAME_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.30");
pub(crate) const OID_CRL_DISTRIBUTION_POINTS: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.31");
pub(crate) const OID_CERTIFICATE_POLICIES: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.32");
pub(crate) const OID_POLICY_MAPPINGS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.33");
pub(crate) const OID_AUTHORITY_KEY_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.35");
pub(crate) const OID_POLICY_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.36");
pub(crate) const OID_EXT_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");
pub(crate) const OID_INHIBIT_ANY_POLICY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.54");
pub(crate) const OID_AUTHORITY_INFO_ACCESS: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.1");
pub(crate) const OID_AD_OCSP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1");

/// Certificate extensions this crate understands when marked critical.
pub(crate) const KNOWN_CERTIFICATE_EXTENSIONS: [ObjectIdentifier; 13] = [
    OID_SUBJECT_KEY_ID,
    OID_KEY_USAGE,
    OID_SUBJECT_ALT_NAME,
    OID_BASIC_CONSTRAINTS,
    OID_NAME_CONSTRAINTS,
    OID_CRL_DISTRIBUTION_POINTS,
    OID_CERTIFICATE_POLICIES,
    OID_POLICY_MAPPINGS,
    OID_AUTHORITY_KEY_ID,
    OID_POLICY_CONSTRAINTS,
    OID_EXT_KEY_USAGE,
    OID_INHIBIT_ANY_POLICY,
    OID_AUTHORITY_INFO_ACCESS,
];

// Years from 2050 on must use GeneralizedTime (RFC 5280 4.1.2.5).
const UTC_TIME_LIMIT: u64 = 2_524_608_000;

// ============================================================================
// Time
// ============================================================================

/// Current unix time in seconds.
pub(crate) fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub(crate) fn to_time(secs: u64) -> Result<Time> {
    let duration = Duration::from_secs(secs);
    if secs < UTC_TIME_LIMIT {
        Ok(Time::UtcTime(UtcTime::from_unix_duration(duration)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(duration)?))
    }
}

pub(crate) fn from_time(time: &Time) -> u64 {
    time.to_unix_duration().as_secs()
}

// ============================================================================
// Extensions
// ============================================================================

/// Encodes `value` as an extension under its associated OID.
pub(crate) fn make_extension<T>(value: &T, critical: bool) -> Result<Extension>
where
    T: AssociatedOid + Encode,
{
    Ok(Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(value.to_der()?)?,
    })
}

pub(crate) fn find_extension(
    extensions: Option<&Vec<Extension>>,
    oid: ObjectIdentifier,
) -> Option<&Extension> {
    extensions?.iter().find(|ext| ext.extn_id == oid)
}

pub(crate) fn decode_extension<T>(extension: &Extension) -> Result<T>
where
    T: for<'a> Decode<'a>,
{
    Ok(T::from_der(extension.extn_value.as_bytes())?)
}

/// Finds and decodes an extension, returning its criticality alongside.
pub(crate) fn certificate_extension<T>(cert: &Certificate) -> Result<Option<(bool, T)>>
where
    T: AssociatedOid + for<'a> Decode<'a>,
{
    match find_extension(cert.tbs_certificate.extensions.as_ref(), T::OID) {
        Some(ext) => Ok(Some((ext.critical, decode_extension(ext)?))),
        None => Ok(None),
    }
}

// ============================================================================
// Keys and algorithms
// ============================================================================

pub(crate) fn algorithm_identifier(scheme: SignatureScheme) -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: scheme.oid(),
        parameters: scheme.has_null_parameters().then(der::Any::null),
    }
}

pub(crate) fn spki_of(key: &PublicKey) -> Result<SubjectPublicKeyInfoOwned> {
    Ok(SubjectPublicKeyInfoOwned::from_der(key.spki_der())?)
}

/// Parses the subject public key of a certificate.
pub fn public_key_of(cert: &Certificate) -> Result<PublicKey> {
    let spki = cert.tbs_certificate.subject_public_key_info.to_der()?;
    Ok(PublicKey::from_spki_der(&spki)?)
}

// ============================================================================
// Encoding
// ============================================================================

/// Lowercase hex of a serial number's magnitude.
pub fn serial_hex(serial: &SerialNumber) -> String {
    let bytes = serial.as_bytes();
    let trimmed = match bytes {
        [0, rest @ ..] if !rest.is_empty() => rest,
        _ => bytes,
    };
    hex::encode(trimmed)
}

pub(crate) fn to_pem(label: &str, der: &[u8]) -> Result<String> {
    Ok(der::pem::encode_string(label, LineEnding::LF, der).map_err(der::Error::from)?)
}

/// Splits a PEM bundle into the DER bodies of its blocks labelled `label`.
pub fn pem_blocks(input: &str, label: &str) -> Result<Vec<Vec<u8>>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let mut blocks = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find(&begin) {
        let after = &rest[start..];
        let stop = after
            .find(&end)
            .ok_or_else(|| PkiError::InvalidCertificate(format!("unterminated {label} block")))?;
        let block = &after[..stop + end.len()];
        let (_, der) = der::pem::decode_vec(block.as_bytes()).map_err(der::Error::from)?;
        blocks.push(der);
        rest = &after[stop + end.len()..];
    }

    Ok(blocks)
}

/// Parses a certificate from PEM or DER.
pub fn parse_certificate(input: &[u8]) -> Result<Certificate> {
    let der = match std::str::from_utf8(input) {
        Ok(text) if text.contains("-----BEGIN") => pem_blocks(text, CERTIFICATE_LABEL)?
            .into_iter()
            .next()
            .ok_or_else(|| PkiError::InvalidCertificate("no CERTIFICATE block".into()))?,
        _ => input.to_vec(),
    };
    Certificate::from_der(&der).map_err(|e| PkiError::InvalidCertificate(e.to_string()))
}

/// Encodes a certificate as PEM.
pub fn certificate_pem(cert: &Certificate) -> Result<String> {
    to_pem(CERTIFICATE_LABEL, &cert.to_der()?)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_time_switches_to_generalized_in_2050() {
        assert!(matches!(to_time(1_700_000_000).unwrap(), Time::UtcTime(_)));
        assert!(matches!(to_time(UTC_TIME_LIMIT).unwrap(), Time::GeneralTime(_)));
        assert_eq!(from_time(&to_time(1_700_000_000).unwrap()), 1_700_000_000);
        assert_eq!(from_time(&to_time(UTC_TIME_LIMIT + 5).unwrap()), UTC_TIME_LIMIT + 5);
    }

    #[test]
    fn test_serial_hex_drops_sign_byte() {
        let serial = SerialNumber::new(&[0x7f, 0x01, 0xab]).unwrap();
        assert_eq!(serial_hex(&serial), "7f01ab");
    }

    #[test]
    fn test_pem_blocks_splits_bundle() {
        let a = to_pem(CERTIFICATE_LABEL, &[0x30, 0x00]).unwrap();
        let b = to_pem(CERTIFICATE_LABEL, &[0x30, 0x01, 0x05]).unwrap();
        let crl = to_pem(CRL_LABEL, &[0x30, 0x00]).unwrap();
        let bundle = format!("{a}\n{crl}{b}");

        let blocks = pem_blocks(&bundle, CERTIFICATE_LABEL).unwrap();
        assert_eq!(blocks, vec![vec![0x30, 0x00], vec![0x30, 0x01, 0x05]]);
        assert_eq!(pem_blocks(&bundle, CRL_LABEL).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_certificate_rejects_garbage() {
        assert!(matches!(
            parse_certificate(b"not a certificate"),
            Err(PkiError::InvalidCertificate(_))
        ));
    }
}
