//! X.509v3 extension assembly per certificate role.

use der::asn1::{Ia5String, OctetString};
use x509_cert::ext::pkix::certpolicy::PolicyInformation;
use x509_cert::ext::pkix::constraints::name::GeneralSubtree;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::ext::pkix::{
    AccessDescription, AuthorityInfoAccessSyntax, AuthorityKeyIdentifier, BasicConstraints,
    CertificatePolicies, CrlDistributionPoints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    NameConstraints, PolicyConstraints, SubjectAltName, SubjectKeyIdentifier,
};
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::Extension;

use sigil_crypto::digest::key_identifier;
use sigil_crypto::PublicKey;

use crate::error::{PkiError, Result};
use crate::profile::{CertificateProfile, NameSubtree, PolicyOptions};
use crate::types::CertificateType;
use crate::x509::{make_extension, OID_AD_OCSP};

/// What the assembler needs to know about the issuing CA.
#[derive(Debug, Clone, Copy)]
pub struct IssuerContext<'a> {
    /// Issuer public key, for the authority key identifier.
    pub public_key: &'a PublicKey,
    /// CRL distribution point URL.
    pub crl_url: Option<&'a str>,
    /// OCSP responder URL.
    pub ocsp_url: Option<&'a str>,
}

impl<'a> IssuerContext<'a> {
    /// Context for a self-signed certificate: no distribution points.
    pub fn self_signed(public_key: &'a PublicKey) -> Self {
        Self {
            public_key,
            crl_url: None,
            ocsp_url: None,
        }
    }
}

/// keyUsage bits for a role.
pub fn key_usage_for(cert_type: CertificateType) -> KeyUsage {
    match cert_type {
        CertificateType::Ca => KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign),
        CertificateType::Server => {
            KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment)
        },
        CertificateType::Client => KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyAgreement),
    }
}

/// Builds the extension set for a certificate.
///
/// basicConstraints and keyUsage are critical; subjectAltName, key
/// identifiers, distribution points and policies are not. CA certificates
/// may additionally carry critical policy and name constraints.
pub fn build_extensions(
    profile: &CertificateProfile,
    subject_key: &PublicKey,
    issuer: &IssuerContext<'_>,
) -> Result<Vec<Extension>> {
    let mut extensions = Vec::new();
    let cert_type = profile.cert_type();

    match profile {
        CertificateProfile::Ca(ca) => {
            extensions.push(make_extension(
                &BasicConstraints {
                    ca: true,
                    path_len_constraint: ca.path_len(),
                },
                true,
            )?);
            extensions.push(make_extension(&key_usage_for(cert_type), true)?);
        },
        CertificateProfile::Server(leaf) | CertificateProfile::Client(leaf) => {
            if leaf.ext_key_usage().is_empty() {
                return Err(PkiError::ExtensionPolicyViolation(format!(
                    "{cert_type} certificate without extendedKeyUsage"
                )));
            }
            let policies = leaf.policies();
            if policies.policy_constraints.is_some() || policies.name_constraints.is_some() {
                return Err(PkiError::ExtensionPolicyViolation(format!(
                    "{cert_type} certificate with policy or name constraints"
                )));
            }
            extensions.push(make_extension(
                &BasicConstraints {
                    ca: false,
                    path_len_constraint: None,
                },
                true,
            )?);
            extensions.push(make_extension(&key_usage_for(cert_type), true)?);
            extensions.push(make_extension(
                &ExtendedKeyUsage(leaf.ext_key_usage().iter().map(|usage| usage.oid()).collect()),
                false,
            )?);
            if !leaf.sans().is_empty() {
                let names = leaf
                    .sans()
                    .entries()
                    .iter()
                    .map(|san| san.to_general_name())
                    .collect::<Result<Vec<_>>>()?;
                extensions.push(make_extension(&SubjectAltName(names), false)?);
            }
        },
    }

    extensions.push(make_extension(
        &SubjectKeyIdentifier(OctetString::new(key_identifier(
            subject_key.subject_public_key(),
        ))?),
        false,
    )?);
    extensions.push(make_extension(&authority_key_identifier(issuer.public_key)?, false)?);

    if let Some(url) = issuer.crl_url {
        let point = DistributionPoint {
            distribution_point: Some(DistributionPointName::FullName(vec![uri(url)?])),
            reasons: None,
            crl_issuer: None,
        };
        extensions.push(make_extension(&CrlDistributionPoints(vec![point]), false)?);
    }

    if let Some(url) = issuer.ocsp_url {
        let access = AccessDescription {
            access_method: OID_AD_OCSP,
            access_location: uri(url)?,
        };
        extensions.push(make_extension(&AuthorityInfoAccessSyntax(vec![access]), false)?);
    }

    push_policy_extensions(&mut extensions, profile.policies())?;

    Ok(extensions)
}

/// authorityKeyIdentifier over an issuer key, shared with CRL generation.
pub(crate) fn authority_key_identifier(issuer_key: &PublicKey) -> Result<AuthorityKeyIdentifier> {
    Ok(AuthorityKeyIdentifier {
        key_identifier: Some(OctetString::new(key_identifier(
            issuer_key.subject_public_key(),
        ))?),
        authority_cert_issuer: None,
        authority_cert_serial_number: None,
    })
}

pub(crate) fn uri(url: &str) -> Result<GeneralName> {
    Ok(GeneralName::UniformResourceIdentifier(Ia5String::new(url)?))
}

fn push_policy_extensions(extensions: &mut Vec<Extension>, policies: &PolicyOptions) -> Result<()> {
    let policy_oids = policies.policy_oids()?;
    if !policy_oids.is_empty() {
        let info = policy_oids
            .into_iter()
            .map(|policy_identifier| PolicyInformation {
                policy_identifier,
                policy_qualifiers: None,
            })
            .collect();
        extensions.push(make_extension(&CertificatePolicies(info), false)?);
    }

    if let Some(constraints) = &policies.policy_constraints {
        extensions.push(make_extension(
            &PolicyConstraints {
                require_explicit_policy: constraints.require_explicit_policy,
                inhibit_policy_mapping: constraints.inhibit_policy_mapping,
            },
            true,
        )?);
    }

    if let Some(constraints) = &policies.name_constraints {
        extensions.push(make_extension(
            &NameConstraints {
                permitted_subtrees: subtrees(&constraints.permitted)?,
                excluded_subtrees: subtrees(&constraints.excluded)?,
            },
            true,
        )?);
    }

    Ok(())
}

fn subtrees(names: &[NameSubtree]) -> Result<Option<Vec<GeneralSubtree>>> {
    if names.is_empty() {
        return Ok(None);
    }
    names
        .iter()
        .map(|name| {
            Ok(GeneralSubtree {
                base: name.to_general_name()?,
                minimum: 0,
                maximum: None,
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::keygen::{generate_key_pair, KeyKind};
    use crate::profile::{NameConstraintsSpec, PolicyConstraintsSpec};
    use crate::x509::{
        decode_extension, find_extension, OID_AUTHORITY_INFO_ACCESS, OID_AUTHORITY_KEY_ID,
        OID_BASIC_CONSTRAINTS, OID_CERTIFICATE_POLICIES, OID_CRL_DISTRIBUTION_POINTS,
        OID_EXT_KEY_USAGE, OID_KEY_USAGE, OID_NAME_CONSTRAINTS, OID_POLICY_CONSTRAINTS,
        OID_SUBJECT_ALT_NAME, OID_SUBJECT_KEY_ID,
    };
    use sigil_crypto::EcCurve;

    fn key() -> PublicKey {
        generate_key_pair(KeyKind::Ecdsa, None, Some(EcCurve::P256))
            .unwrap()
            .public_key()
            .clone()
    }

    fn ext<'a>(extensions: &'a Vec<Extension>, oid: const_oid::ObjectIdentifier) -> &'a Extension {
        find_extension(Some(extensions), oid).unwrap()
    }

    #[test]
    fn test_ca_extensions() {
        let subject = key();
        let issuer = key();
        let profile = CertificateProfile::ca(Some(0), PolicyOptions::default()).unwrap();

        let extensions =
            build_extensions(&profile, &subject, &IssuerContext::self_signed(&issuer)).unwrap();

        let bc = ext(&extensions, OID_BASIC_CONSTRAINTS);
        assert!(bc.critical);
        let bc: BasicConstraints = decode_extension(bc).unwrap();
        assert!(bc.ca);
        assert_eq!(bc.path_len_constraint, Some(0));

        let ku = ext(&extensions, OID_KEY_USAGE);
        assert!(ku.critical);
        let ku: KeyUsage = decode_extension(ku).unwrap();
        assert!(ku.0.contains(KeyUsages::KeyCertSign));
        assert!(ku.0.contains(KeyUsages::CRLSign));
        assert!(!ku.0.contains(KeyUsages::DigitalSignature));

        assert!(find_extension(Some(&extensions), OID_EXT_KEY_USAGE).is_none());
        assert!(find_extension(Some(&extensions), OID_SUBJECT_ALT_NAME).is_none());
        assert!(find_extension(Some(&extensions), OID_CRL_DISTRIBUTION_POINTS).is_none());
        assert!(!ext(&extensions, OID_SUBJECT_KEY_ID).critical);
    }

    #[test]
    fn test_server_extensions() {
        let subject = key();
        let issuer = key();
        let profile =
            CertificateProfile::server(&["example.com", "*.example.com", "203.0.113.5"]).unwrap();
        let context = IssuerContext {
            public_key: &issuer,
            crl_url: Some("http://pki.example.com/root.crl"),
            ocsp_url: Some("http://ocsp.example.com"),
        };

        let extensions = build_extensions(&profile, &subject, &context).unwrap();

        let bc: BasicConstraints =
            decode_extension(ext(&extensions, OID_BASIC_CONSTRAINTS)).unwrap();
        assert!(!bc.ca);

        let ku: KeyUsage = decode_extension(ext(&extensions, OID_KEY_USAGE)).unwrap();
        assert!(ku.0.contains(KeyUsages::DigitalSignature));
        assert!(ku.0.contains(KeyUsages::KeyEncipherment));

        let eku: ExtendedKeyUsage = decode_extension(ext(&extensions, OID_EXT_KEY_USAGE)).unwrap();
        assert_eq!(eku.0, vec![crate::profile::ExtKeyUsage::ServerAuth.oid()]);

        let san_ext = ext(&extensions, OID_SUBJECT_ALT_NAME);
        assert!(!san_ext.critical);
        let san: SubjectAltName = decode_extension(san_ext).unwrap();
        let dns = san.0.iter().filter(|n| matches!(n, GeneralName::DnsName(_))).count();
        let ips = san.0.iter().filter(|n| matches!(n, GeneralName::IpAddress(_))).count();
        assert_eq!((dns, ips), (2, 1));

        let aki: AuthorityKeyIdentifier =
            decode_extension(ext(&extensions, OID_AUTHORITY_KEY_ID)).unwrap();
        assert_eq!(
            aki.key_identifier.unwrap().as_bytes(),
            key_identifier(issuer.subject_public_key()).as_slice()
        );

        let dp: CrlDistributionPoints =
            decode_extension(ext(&extensions, OID_CRL_DISTRIBUTION_POINTS)).unwrap();
        assert_eq!(dp.0.len(), 1);
        let aia: AuthorityInfoAccessSyntax =
            decode_extension(ext(&extensions, OID_AUTHORITY_INFO_ACCESS)).unwrap();
        assert_eq!(aia.0[0].access_method, OID_AD_OCSP);
    }

    #[test]
    fn test_deserialized_profile_extensions() {
        let subject = key();
        let profile: CertificateProfile = serde_json::from_value(serde_json::json!({
            "role": "server",
            "sans": ["api.example.com"],
            "ext_key_usage": ["server-auth", "client-auth"]
        }))
        .unwrap();

        let extensions =
            build_extensions(&profile, &subject, &IssuerContext::self_signed(&subject)).unwrap();
        let eku: ExtendedKeyUsage = decode_extension(ext(&extensions, OID_EXT_KEY_USAGE)).unwrap();
        assert_eq!(eku.0.len(), 2);
        assert!(find_extension(Some(&extensions), OID_NAME_CONSTRAINTS).is_none());

        let err = serde_json::from_value::<CertificateProfile>(serde_json::json!({
            "role": "server",
            "sans": ["api.example.com"],
            "ext_key_usage": []
        }))
        .unwrap_err();
        assert!(err.to_string().contains("extendedKeyUsage"));
    }

    #[test]
    fn test_client_key_usage() {
        let ku = key_usage_for(CertificateType::Client);
        assert!(ku.0.contains(KeyUsages::KeyAgreement));
        assert!(!ku.0.contains(KeyUsages::KeyEncipherment));
    }

    #[test]
    fn test_policy_extensions() {
        let subject = key();
        let policies = PolicyOptions {
            certificate_policies: vec!["2.23.140.1.2.1".into()],
            policy_constraints: Some(PolicyConstraintsSpec {
                require_explicit_policy: Some(0),
                inhibit_policy_mapping: None,
            }),
            name_constraints: Some(NameConstraintsSpec {
                permitted: vec!["dns:example.com".parse().unwrap()],
                excluded: vec!["ip:10.0.0.0/8".parse().unwrap()],
            }),
        };
        let profile = CertificateProfile::ca(None, policies).unwrap();

        let extensions =
            build_extensions(&profile, &subject, &IssuerContext::self_signed(&subject)).unwrap();

        assert!(!ext(&extensions, OID_CERTIFICATE_POLICIES).critical);
        assert!(ext(&extensions, OID_POLICY_CONSTRAINTS).critical);
        let nc = ext(&extensions, OID_NAME_CONSTRAINTS);
        assert!(nc.critical);
        let nc: NameConstraints = decode_extension(nc).unwrap();
        assert_eq!(nc.permitted_subtrees.unwrap().len(), 1);
        assert_eq!(nc.excluded_subtrees.unwrap().len(), 1);
    }
}
