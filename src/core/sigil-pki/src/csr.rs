//! PKCS#10 certificate signing requests.

use const_oid::ObjectIdentifier;
use der::asn1::{Any, BitString, SetOfVec};
use der::{Decode, Encode};
use x509_cert::attr::Attribute;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::request::{CertReq, CertReqInfo, Version};

use sigil_crypto::PublicKey;

use crate::error::{PkiError, Result};
use crate::extensions::key_usage_for;
use crate::keygen::KeyPair;
use crate::name::DistinguishedName;
use crate::profile::{SanEntry, SanList};
use crate::signing::verify_signature;
use crate::types::CertificateType;
use crate::x509::{self, algorithm_identifier, make_extension, CSR_LABEL};

const OID_EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// Extensions asked for in a CSR.
#[derive(Debug, Clone, Default)]
pub struct RequestedExtensions {
    /// Subject alternative names.
    pub sans: SanList,
    /// Role whose keyUsage bits are requested.
    pub key_usage: Option<CertificateType>,
}

/// A signed CSR.
#[derive(Debug, Clone)]
pub struct Csr {
    request: CertReq,
    der: Vec<u8>,
}

impl Csr {
    /// DER encoding.
    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// PEM encoding.
    pub fn to_pem(&self) -> Result<String> {
        x509::to_pem(CSR_LABEL, &self.der)
    }

    /// Requested subject.
    pub fn subject(&self) -> &Name {
        &self.request.info.subject
    }
}

/// Builds a CSR for `subject_dn` and self-signs it with `key_pair`.
///
/// Fails with [`PkiError::CsrConstruction`] if the DN cannot be split into
/// C, ST, L, O, OU and CN components.
pub fn generate_csr(
    subject_dn: &str,
    key_pair: &KeyPair,
    requested: &RequestedExtensions,
) -> Result<Csr> {
    let subject = DistinguishedName::parse(subject_dn)?
        .to_name()
        .map_err(|e| PkiError::CsrConstruction(e.to_string()))?;

    let mut extensions = Vec::new();
    if !requested.sans.is_empty() {
        let names = requested
            .sans
            .entries()
            .iter()
            .map(SanEntry::to_general_name)
            .collect::<Result<Vec<_>>>()?;
        extensions.push(make_extension(&SubjectAltName(names), false)?);
    }
    if let Some(role) = requested.key_usage {
        extensions.push(make_extension(&key_usage_for(role), true)?);
    }

    let attributes = if extensions.is_empty() {
        SetOfVec::new()
    } else {
        let value = Any::encode_from(&extensions)?;
        SetOfVec::try_from(vec![Attribute {
            oid: OID_EXTENSION_REQUEST,
            values: SetOfVec::try_from(vec![value])?,
        }])?
    };

    let scheme = key_pair.algorithm().signature_scheme();
    let info = CertReqInfo {
        version: Version::V1,
        subject,
        public_key: x509::spki_of(key_pair.public_key())?,
        attributes,
    };
    let signature = key_pair.private_key().sign(&info.to_der()?)?;

    let request = CertReq {
        info,
        algorithm: algorithm_identifier(scheme),
        signature: BitString::from_bytes(&signature)?,
    };
    let der = request.to_der()?;

    Ok(Csr { request, der })
}

/// A CSR whose proof of possession checked out.
#[derive(Debug, Clone)]
pub struct VerifiedCsr {
    /// Requested subject.
    pub subject: Name,
    /// Key to certify.
    pub public_key: PublicKey,
    /// SANs from the extensionRequest attribute.
    pub requested_sans: Vec<SanEntry>,
}

/// Parses a PEM or DER CSR and verifies its self-signature.
///
/// Fails with [`PkiError::InvalidCsr`] on malformed input, an unsupported
/// key or algorithm, or a signature that does not verify.
pub fn parse_and_verify(input: &[u8]) -> Result<VerifiedCsr> {
    let invalid = |reason: String| PkiError::InvalidCsr(reason);

    let der = match std::str::from_utf8(input) {
        Ok(text) if text.contains("-----BEGIN") => {
            let (label, der) = der::pem::decode_vec(text.trim().as_bytes())
                .map_err(|e| invalid(e.to_string()))?;
            if label != CSR_LABEL && label != "NEW CERTIFICATE REQUEST" {
                return Err(invalid(format!("unexpected PEM label {label}")));
            }
            der
        },
        _ => input.to_vec(),
    };

    let request = CertReq::from_der(&der).map_err(|e| invalid(e.to_string()))?;
    let spki = request
        .info
        .public_key
        .to_der()
        .map_err(|e| invalid(e.to_string()))?;
    let public_key = PublicKey::from_spki_der(&spki).map_err(|e| invalid(e.to_string()))?;
    let info = request.info.to_der().map_err(|e| invalid(e.to_string()))?;

    verify_signature(&public_key, &request.algorithm, &info, &request.signature)
        .map_err(|reason| invalid(format!("self-signature does not verify: {reason}")))?;

    let mut requested_sans = Vec::new();
    for attribute in request.info.attributes.iter() {
        if attribute.oid != OID_EXTENSION_REQUEST {
            continue;
        }
        for value in attribute.values.iter() {
            let extensions: Vec<Extension> = value
                .decode_as()
                .map_err(|e| invalid(format!("extensionRequest: {e}")))?;
            for ext in extensions.iter().filter(|e| e.extn_id == x509::OID_SUBJECT_ALT_NAME) {
                let san: SubjectAltName = x509::decode_extension(ext)
                    .map_err(|e| invalid(format!("subjectAltName: {e}")))?;
                requested_sans.extend(san.0.iter().filter_map(SanEntry::from_general_name));
            }
        }
    }

    Ok(VerifiedCsr {
        subject: request.info.subject,
        public_key,
        requested_sans,
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::keygen::{generate_key_pair, KeyKind};
    use crate::name::display_name;
    use sigil_crypto::EcCurve;

    fn requested(sans: &[&str]) -> RequestedExtensions {
        RequestedExtensions {
            sans: SanList::parse(sans).unwrap(),
            key_usage: Some(CertificateType::Server),
        }
    }

    #[test]
    fn test_generate_and_verify() {
        let pair = generate_key_pair(KeyKind::Ecdsa, None, Some(EcCurve::P256)).unwrap();
        let csr = generate_csr(
            "CN=api.example.com, O=Example, C=US",
            &pair,
            &requested(&["api.example.com", "10.1.2.3"]),
        )
        .unwrap();

        let pem = csr.to_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));

        let verified = parse_and_verify(pem.as_bytes()).unwrap();
        assert_eq!(display_name(&verified.subject), "CN=api.example.com, O=Example, C=US");
        assert_eq!(verified.public_key.spki_der(), pair.public_key().spki_der());
        assert_eq!(
            verified.requested_sans,
            vec![
                SanEntry::Dns("api.example.com".into()),
                SanEntry::Ip("10.1.2.3".parse().unwrap()),
            ]
        );

        let from_der = parse_and_verify(csr.to_der()).unwrap();
        assert_eq!(from_der.subject, verified.subject);
    }

    #[test]
    fn test_all_key_types_self_sign() {
        for (kind, size, curve) in [
            (KeyKind::Ed25519, None, None),
            (KeyKind::Ecdsa, None, Some(EcCurve::P384)),
            (KeyKind::Rsa, Some(2048), None),
        ] {
            let pair = generate_key_pair(kind, size, curve).unwrap();
            let csr = generate_csr("CN=device-42", &pair, &RequestedExtensions::default()).unwrap();
            let verified = parse_and_verify(csr.to_der()).unwrap();
            assert!(verified.requested_sans.is_empty());
        }
    }

    #[test]
    fn test_bad_subject_is_construction_error() {
        let pair = generate_key_pair(KeyKind::Ed25519, None, None).unwrap();
        let err = generate_csr("just a name", &pair, &RequestedExtensions::default()).unwrap_err();
        assert!(matches!(err, PkiError::CsrConstruction(_)));
    }

    #[test]
    fn test_tampered_csr_rejected() {
        let pair = generate_key_pair(KeyKind::Ecdsa, None, Some(EcCurve::P256)).unwrap();
        let csr = generate_csr("CN=legit.example.com", &pair, &requested(&["legit.example.com"]))
            .unwrap();

        let mut der = csr.to_der().to_vec();
        let position = der
            .windows(5)
            .position(|w| w == b"legit")
            .unwrap();
        der[position] = b'e';

        let err = parse_and_verify(&der).unwrap_err();
        assert!(matches!(err, PkiError::InvalidCsr(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            parse_and_verify(b"\x30\x03\x02\x01\x00"),
            Err(PkiError::InvalidCsr(_))
        ));
        assert!(matches!(
            parse_and_verify(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n"),
            Err(PkiError::InvalidCsr(_))
        ));
    }
}
