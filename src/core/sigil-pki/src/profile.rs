//! Certificate profiles: what a certificate of each role may carry.
//!
//! A [`CertificateProfile`] is validated when it is built. Once constructed,
//! its SAN list, key purposes and constraints are known to be well formed,
//! so the extension assembler only has to encode them.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use const_oid::ObjectIdentifier;
use der::asn1::{Ia5String, OctetString};
use serde::{Deserialize, Serialize};
use x509_cert::ext::pkix::name::GeneralName;

use crate::error::{FieldViolation, PkiError, Result};
use crate::types::CertificateType;

const MAX_DNS_LENGTH: usize = 253;
const MAX_LABEL_LENGTH: usize = 63;

// ============================================================================
// Subject alternative names
// ============================================================================

/// One subject alternative name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SanEntry {
    /// `example.com`
    Dns(String),
    /// `*.example.com`
    WildcardDns(String),
    /// IPv4 or IPv6 address, encoded as iPAddress.
    Ip(IpAddr),
}

impl SanEntry {
    /// Parses one SAN. Strings that look like IP literals must be valid IPs.
    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let value = input.trim();
        if value.is_empty() {
            return Err("empty SAN".into());
        }

        if looks_like_ip(value) {
            return value
                .parse::<IpAddr>()
                .map(SanEntry::Ip)
                .map_err(|_| format!("malformed IP literal '{value}'"));
        }

        if let Some(base) = value.strip_prefix("*.") {
            validate_dns(base)?;
            if !base.contains('.') {
                return Err(format!("wildcard '{value}' must cover a subdomain"));
            }
            return Ok(SanEntry::WildcardDns(value.to_ascii_lowercase()));
        }

        validate_dns(value)?;
        Ok(SanEntry::Dns(value.to_ascii_lowercase()))
    }

    /// Encodes the entry as a GeneralName.
    pub fn to_general_name(&self) -> Result<GeneralName> {
        Ok(match self {
            SanEntry::Dns(name) | SanEntry::WildcardDns(name) => {
                GeneralName::DnsName(Ia5String::new(name)?)
            },
            SanEntry::Ip(IpAddr::V4(ip)) => GeneralName::IpAddress(OctetString::new(ip.octets())?),
            SanEntry::Ip(IpAddr::V6(ip)) => GeneralName::IpAddress(OctetString::new(ip.octets())?),
        })
    }

    /// Reads a GeneralName back; other name forms yield `None`.
    pub fn from_general_name(name: &GeneralName) -> Option<Self> {
        match name {
            GeneralName::DnsName(dns) => SanEntry::parse(&dns.to_string()).ok(),
            GeneralName::IpAddress(bytes) => ip_from_octets(bytes.as_bytes()).map(SanEntry::Ip),
            _ => None,
        }
    }
}

impl fmt::Display for SanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanEntry::Dns(name) | SanEntry::WildcardDns(name) => f.write_str(name),
            SanEntry::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// Parses an iPAddress octet string (4 or 16 bytes).
pub(crate) fn ip_from_octets(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

fn looks_like_ip(value: &str) -> bool {
    value.contains(':') || value.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn validate_dns(name: &str) -> std::result::Result<(), String> {
    if name.len() > MAX_DNS_LENGTH {
        return Err(format!("DNS name longer than {MAX_DNS_LENGTH} characters"));
    }
    for label in name.split('.') {
        if label.is_empty() {
            return Err(format!("empty DNS label in '{name}'"));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(format!("DNS label longer than {MAX_LABEL_LENGTH} characters in '{name}'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("invalid character in DNS label '{label}'"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("DNS label '{label}' starts or ends with '-'"));
        }
    }
    Ok(())
}

/// A validated, duplicate-free SAN list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct SanList(Vec<SanEntry>);

impl SanList {
    /// Validates every entry and reports each failure as `sans[i]`.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> std::result::Result<Self, Vec<FieldViolation>> {
        let mut list = Vec::new();
        let mut violations = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            match SanEntry::parse(entry.as_ref()) {
                Ok(san) if !list.contains(&san) => list.push(san),
                Ok(_) => {},
                Err(reason) => violations.push(FieldViolation::new(format!("sans[{i}]"), reason)),
            }
        }

        if violations.is_empty() {
            Ok(Self(list))
        } else {
            Err(violations)
        }
    }

    /// Entries in request order.
    pub fn entries(&self) -> &[SanEntry] {
        &self.0
    }

    /// True when no SAN was requested.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn from_entries(entries: Vec<SanEntry>) -> Self {
        let mut list: Vec<SanEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if !list.contains(&entry) {
                list.push(entry);
            }
        }
        Self(list)
    }
}

impl TryFrom<Vec<String>> for SanList {
    type Error = String;

    fn try_from(entries: Vec<String>) -> std::result::Result<Self, Self::Error> {
        SanList::parse(&entries).map_err(|violations| {
            violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

impl From<SanList> for Vec<String> {
    fn from(list: SanList) -> Self {
        list.0.iter().map(ToString::to_string).collect()
    }
}

// ============================================================================
// Key purposes and policies
// ============================================================================

/// Extended key usage purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtKeyUsage {
    /// TLS server authentication.
    ServerAuth,
    /// TLS client authentication.
    ClientAuth,
    /// Code signing.
    CodeSigning,
    /// S/MIME.
    EmailProtection,
}

impl ExtKeyUsage {
    /// KeyPurposeId OID.
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            ExtKeyUsage::ServerAuth => ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1"),
            ExtKeyUsage::ClientAuth => ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2"),
            ExtKeyUsage::CodeSigning => ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3"),
            ExtKeyUsage::EmailProtection => ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.4"),
        }
    }
}

impl FromStr for ExtKeyUsage {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "server-auth" | "serverauth" => Ok(ExtKeyUsage::ServerAuth),
            "client-auth" | "clientauth" => Ok(ExtKeyUsage::ClientAuth),
            "code-signing" | "codesigning" => Ok(ExtKeyUsage::CodeSigning),
            "email-protection" | "emailprotection" => Ok(ExtKeyUsage::EmailProtection),
            _ => Err(PkiError::Validation(vec![FieldViolation::new(
                "ext_key_usage",
                format!("unknown extended key usage '{s}'"),
            )])),
        }
    }
}

/// A name constraint subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NameSubtree {
    /// A DNS domain and all its subdomains.
    Dns {
        /// Domain, e.g. `example.com`.
        domain: String,
    },
    /// An IP network.
    Ip {
        /// Network address.
        network: IpAddr,
        /// Prefix length.
        prefix: u8,
    },
}

impl NameSubtree {
    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            NameSubtree::Dns { domain } => validate_dns(domain.trim_start_matches('.')),
            NameSubtree::Ip { network, prefix } => {
                let max = if network.is_ipv4() { 32 } else { 128 };
                if *prefix > max {
                    return Err(format!("prefix /{prefix} too long for {network}"));
                }
                Ok(())
            },
        }
    }

    /// Encodes the subtree base as a GeneralName (`address || mask` for IPs).
    pub(crate) fn to_general_name(&self) -> Result<GeneralName> {
        match self {
            NameSubtree::Dns { domain } => Ok(GeneralName::DnsName(Ia5String::new(domain)?)),
            NameSubtree::Ip { network, prefix } => {
                let (mut bytes, width) = match network {
                    IpAddr::V4(ip) => (ip.octets().to_vec(), 32u32),
                    IpAddr::V6(ip) => (ip.octets().to_vec(), 128u32),
                };
                let mask = prefix_mask(u32::from(*prefix), width);
                bytes.extend_from_slice(&mask);
                Ok(GeneralName::IpAddress(OctetString::new(bytes)?))
            },
        }
    }
}

impl FromStr for NameSubtree {
    type Err = PkiError;

    /// `dns:example.com` or `ip:10.0.0.0/8`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: String| {
            PkiError::Validation(vec![FieldViolation::new("name_constraints", reason)])
        };
        let subtree = match s.split_once(':') {
            Some(("dns", domain)) => NameSubtree::Dns {
                domain: domain.to_ascii_lowercase(),
            },
            Some(("ip", cidr)) => {
                let (network, prefix) = cidr
                    .split_once('/')
                    .ok_or_else(|| invalid(format!("'{cidr}' is not address/prefix")))?;
                NameSubtree::Ip {
                    network: network
                        .parse()
                        .map_err(|_| invalid(format!("malformed IP literal '{network}'")))?,
                    prefix: prefix
                        .parse()
                        .map_err(|_| invalid(format!("malformed prefix '{prefix}'")))?,
                }
            },
            _ => return Err(invalid(format!("'{s}' must start with dns: or ip:"))),
        };
        subtree.validate().map_err(invalid)?;
        Ok(subtree)
    }
}

pub(crate) fn prefix_mask(prefix: u32, width: u32) -> Vec<u8> {
    (0..width / 8)
        .map(|i| {
            let bits = prefix.saturating_sub(i * 8).min(8);
            if bits == 0 {
                0
            } else {
                0xffu8 << (8 - bits)
            }
        })
        .collect()
}

/// Permitted and excluded subtrees for a CA certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameConstraintsSpec {
    /// Subordinate names must fall inside one of these.
    #[serde(default)]
    pub permitted: Vec<NameSubtree>,
    /// Subordinate names must fall inside none of these.
    #[serde(default)]
    pub excluded: Vec<NameSubtree>,
}

/// policyConstraints skip counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConstraintsSpec {
    /// requireExplicitPolicy.
    pub require_explicit_policy: Option<u32>,
    /// inhibitPolicyMapping.
    pub inhibit_policy_mapping: Option<u32>,
}

/// Optional policy extensions set by the issuing policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOptions {
    /// Certificate policy OIDs, dotted form.
    pub certificate_policies: Vec<String>,
    /// CA only.
    pub policy_constraints: Option<PolicyConstraintsSpec>,
    /// CA only.
    pub name_constraints: Option<NameConstraintsSpec>,
}

impl PolicyOptions {
    fn validate(&self) -> Result<()> {
        for oid in &self.certificate_policies {
            ObjectIdentifier::new(oid).map_err(|_| {
                PkiError::ExtensionPolicyViolation(format!("'{oid}' is not a policy OID"))
            })?;
        }
        if let Some(constraints) = &self.policy_constraints {
            if constraints.require_explicit_policy.is_none()
                && constraints.inhibit_policy_mapping.is_none()
            {
                return Err(PkiError::ExtensionPolicyViolation(
                    "policyConstraints needs at least one field".into(),
                ));
            }
        }
        if let Some(constraints) = &self.name_constraints {
            if constraints.permitted.is_empty() && constraints.excluded.is_empty() {
                return Err(PkiError::ExtensionPolicyViolation(
                    "nameConstraints needs a permitted or excluded subtree".into(),
                ));
            }
            for subtree in constraints.permitted.iter().chain(&constraints.excluded) {
                subtree
                    .validate()
                    .map_err(|reason| PkiError::ExtensionPolicyViolation(format!("nameConstraints: {reason}")))?;
            }
        }
        Ok(())
    }

    pub(crate) fn policy_oids(&self) -> Result<Vec<ObjectIdentifier>> {
        self.certificate_policies
            .iter()
            .map(|oid| {
                ObjectIdentifier::new(oid).map_err(|_| {
                    PkiError::ExtensionPolicyViolation(format!("'{oid}' is not a policy OID"))
                })
            })
            .collect()
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// Fields of a CA certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaProfile {
    path_len: Option<u8>,
    policies: PolicyOptions,
}

impl CaProfile {
    /// pathLenConstraint.
    pub fn path_len(&self) -> Option<u8> {
        self.path_len
    }

    /// Policy extensions, constraints included.
    pub fn policies(&self) -> &PolicyOptions {
        &self.policies
    }
}

/// Fields of a server or client certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeafProfile {
    sans: SanList,
    ext_key_usage: Vec<ExtKeyUsage>,
    policies: PolicyOptions,
}

impl LeafProfile {
    /// Subject alternative names.
    pub fn sans(&self) -> &SanList {
        &self.sans
    }

    /// Extended key usages, never empty.
    pub fn ext_key_usage(&self) -> &[ExtKeyUsage] {
        &self.ext_key_usage
    }

    /// Certificate policies; constraints are not allowed on leaves.
    pub fn policies(&self) -> &PolicyOptions {
        &self.policies
    }
}

/// The extension policy for one certificate, by role.
///
/// Deserialization goes through [`CertificateProfile::from_parts`], so a
/// profile read from JSON or TOML obeys the same rules as a constructed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase", try_from = "RawProfile")]
pub enum CertificateProfile {
    /// Subordinate CA.
    Ca(CaProfile),
    /// TLS server.
    Server(LeafProfile),
    /// TLS client.
    Client(LeafProfile),
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawRole {
    Ca,
    Server,
    Client,
}

/// Serialized form of a [`CertificateProfile`], before validation.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    role: RawRole,
    #[serde(default)]
    sans: Vec<String>,
    ext_key_usage: Option<Vec<ExtKeyUsage>>,
    #[serde(default)]
    path_len: Option<u8>,
    #[serde(default)]
    policies: PolicyOptions,
}

impl TryFrom<RawProfile> for CertificateProfile {
    type Error = PkiError;

    fn try_from(raw: RawProfile) -> Result<Self> {
        let cert_type = match raw.role {
            RawRole::Ca => CertificateType::Ca,
            RawRole::Server => CertificateType::Server,
            RawRole::Client => CertificateType::Client,
        };
        // An absent list means the role default; an explicit empty one is an error.
        if cert_type != CertificateType::Ca && raw.ext_key_usage.as_ref().is_some_and(Vec::is_empty) {
            return Err(PkiError::ExtensionPolicyViolation(
                "extendedKeyUsage must list at least one purpose".into(),
            ));
        }
        Self::from_parts(
            cert_type,
            &raw.sans,
            raw.ext_key_usage.unwrap_or_default(),
            raw.path_len,
            raw.policies,
        )
    }
}

impl CertificateProfile {
    /// CA profile.
    pub fn ca(path_len: Option<u8>, policies: PolicyOptions) -> Result<Self> {
        policies.validate()?;
        Ok(CertificateProfile::Ca(CaProfile { path_len, policies }))
    }

    /// Server profile with `serverAuth`.
    pub fn server<S: AsRef<str>>(sans: &[S]) -> Result<Self> {
        Self::from_parts(CertificateType::Server, sans, Vec::new(), None, PolicyOptions::default())
    }

    /// Client profile with `clientAuth`.
    pub fn client<S: AsRef<str>>(sans: &[S]) -> Result<Self> {
        Self::from_parts(CertificateType::Client, sans, Vec::new(), None, PolicyOptions::default())
    }

    /// Builds a profile from loosely specified request fields.
    ///
    /// Fails with [`PkiError::ExtensionPolicyViolation`] when a field does not
    /// belong to the role (extended key usage or SANs on a CA, path length or
    /// constraints on a leaf) or a SAN is malformed. Leaves without explicit
    /// purposes get `serverAuth` or `clientAuth`.
    pub fn from_parts<S: AsRef<str>>(
        cert_type: CertificateType,
        sans: &[S],
        ext_key_usage: Vec<ExtKeyUsage>,
        path_len: Option<u8>,
        policies: PolicyOptions,
    ) -> Result<Self> {
        policies.validate()?;

        if cert_type == CertificateType::Ca {
            if !ext_key_usage.is_empty() {
                return Err(PkiError::ExtensionPolicyViolation(
                    "CA certificates must not carry extendedKeyUsage".into(),
                ));
            }
            if !sans.is_empty() {
                return Err(PkiError::ExtensionPolicyViolation(
                    "CA certificates must not carry subjectAltName".into(),
                ));
            }
            return Ok(CertificateProfile::Ca(CaProfile { path_len, policies }));
        }

        if path_len.is_some() {
            return Err(PkiError::ExtensionPolicyViolation(format!(
                "pathLenConstraint is only valid on CA certificates, not {cert_type}"
            )));
        }
        if policies.policy_constraints.is_some() || policies.name_constraints.is_some() {
            return Err(PkiError::ExtensionPolicyViolation(format!(
                "policy and name constraints are only valid on CA certificates, not {cert_type}"
            )));
        }

        let sans = SanList::parse(sans).map_err(|violations| {
            PkiError::ExtensionPolicyViolation(
                violations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let default_usage = if cert_type == CertificateType::Server {
            ExtKeyUsage::ServerAuth
        } else {
            ExtKeyUsage::ClientAuth
        };
        let ext_key_usage = if ext_key_usage.is_empty() {
            vec![default_usage]
        } else {
            ext_key_usage
        };

        let leaf = LeafProfile {
            sans,
            ext_key_usage,
            policies,
        };
        Ok(match cert_type {
            CertificateType::Server => CertificateProfile::Server(leaf),
            _ => CertificateProfile::Client(leaf),
        })
    }

    /// Role of the certificate.
    pub fn cert_type(&self) -> CertificateType {
        match self {
            CertificateProfile::Ca(_) => CertificateType::Ca,
            CertificateProfile::Server(_) => CertificateType::Server,
            CertificateProfile::Client(_) => CertificateType::Client,
        }
    }

    /// Policy extensions of the profile.
    pub fn policies(&self) -> &PolicyOptions {
        match self {
            CertificateProfile::Ca(ca) => &ca.policies,
            CertificateProfile::Server(leaf) | CertificateProfile::Client(leaf) => &leaf.policies,
        }
    }

    /// Replaces an empty SAN list, e.g. with the names requested in a CSR.
    pub(crate) fn with_default_sans(mut self, sans: Vec<SanEntry>) -> Self {
        if let CertificateProfile::Server(leaf) | CertificateProfile::Client(leaf) = &mut self {
            if leaf.sans.is_empty() {
                leaf.sans = SanList::from_entries(sans);
            }
        }
        self
    }
}
