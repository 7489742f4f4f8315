//! Certificate chain validation.
//!
//! [`validate_chain`] walks issuer references from a leaf towards a root,
//! using only the intermediates and trust anchors it is given. Problems with
//! the certificates themselves (expiry, bad signatures, missing extensions,
//! an untrusted root) are collected as [`ChainIssue`]s so one call reports
//! everything; only a walk longer than the configured bound is an error.
//!
//! [`ChainValidator`] adds a trust anchor snapshot and a bounded result
//! cache on top.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use const_oid::ObjectIdentifier;
use der::Encode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, KeyUsage, KeyUsages, NameConstraints,
    SubjectAltName, SubjectKeyIdentifier,
};
use x509_cert::Certificate;

use sigil_crypto::digest::{fingerprint, sha256};
use sigil_crypto::KeyAlgorithm;

use crate::config::PkiConfig;
use crate::engine::PkiEngine;
use crate::error::{PkiError, Result};
use crate::name::display_name;
use crate::profile::SanEntry;
use crate::signing::verify_certificate;
use crate::x509::{
    self, certificate_extension, parse_certificate, pem_blocks, public_key_of, serial_hex,
    CERTIFICATE_LABEL, KNOWN_CERTIFICATE_EXTENSIONS, OID_AUTHORITY_KEY_ID,
    OID_BASIC_CONSTRAINTS, OID_KEY_USAGE, OID_SUBJECT_KEY_ID,
};

const MIN_RSA_BITS: u32 = 2048;

const WEAK_SIGNATURE_ALGORITHMS: [(ObjectIdentifier, &str); 4] = [
    (ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.4"), "md5WithRSAEncryption"),
    (ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5"), "sha1WithRSAEncryption"),
    (ObjectIdentifier::new_unwrap("1.2.840.10045.4.1"), "ecdsa-with-SHA1"),
    (ObjectIdentifier::new_unwrap("1.2.840.10040.4.3"), "dsa-with-SHA1"),
];

// ============================================================================
// Trust anchors
// ============================================================================

/// An immutable set of trusted root certificates.
#[derive(Clone)]
pub struct TrustAnchorSet {
    anchors: Vec<(Vec<u8>, Certificate)>,
    hash: [u8; 32],
}

impl TrustAnchorSet {
    /// Builds a set; duplicates are dropped and order does not matter.
    pub fn new(certificates: Vec<Certificate>) -> Result<Self> {
        let mut anchors = Vec::with_capacity(certificates.len());
        for cert in certificates {
            anchors.push((cert.to_der()?, cert));
        }
        anchors.sort_by(|a, b| a.0.cmp(&b.0));
        anchors.dedup_by(|a, b| a.0 == b.0);

        let mut digests = Vec::with_capacity(anchors.len() * 32);
        for (der, _) in &anchors {
            digests.extend_from_slice(&sha256(der));
        }

        Ok(Self {
            hash: sha256(&digests),
            anchors,
        })
    }

    /// The empty set: nothing is trusted.
    pub fn empty() -> Self {
        Self {
            anchors: Vec::new(),
            hash: sha256(&[]),
        }
    }

    /// Builds a set from a PEM bundle.
    pub fn from_pem(bundle: &str) -> Result<Self> {
        let certificates = pem_blocks(bundle, CERTIFICATE_LABEL)?
            .iter()
            .map(|der| parse_certificate(der))
            .collect::<Result<Vec<_>>>()?;
        Self::new(certificates)
    }

    /// Stable SHA-256 over the member certificates, hex encoded.
    pub fn hash(&self) -> String {
        hex::encode(self.hash)
    }

    /// Number of anchors.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// True when nothing is trusted.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Whether this exact certificate is an anchor.
    pub fn contains(&self, der: &[u8]) -> bool {
        self.anchors
            .binary_search_by(|(anchor, _)| anchor.as_slice().cmp(der))
            .is_ok()
    }

    /// The anchor certificates.
    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.anchors.iter().map(|(_, cert)| cert)
    }
}

impl fmt::Debug for TrustAnchorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchorSet")
            .field("len", &self.anchors.len())
            .field("hash", &self.hash())
            .finish()
    }
}

// ============================================================================
// Options and results
// ============================================================================

/// What [`validate_chain`] checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    /// Longest chain, leaf and root included.
    pub max_chain_length: usize,
    /// The terminal certificate must be a self-signed trust anchor.
    pub require_trusted_root: bool,
    /// Issuers must assert keyCertSign.
    pub check_key_usage: bool,
    /// Required extensions, criticality and algorithm strength.
    pub validate_extensions: bool,
    /// Validation time (unix seconds); now when absent.
    pub at: Option<u64>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            max_chain_length: 10,
            require_trusted_root: true,
            check_key_usage: true,
            validate_extensions: true,
            at: None,
        }
    }
}

impl ValidationOptions {
    /// Defaults with the configured chain length bound.
    pub fn from_config(config: &PkiConfig) -> Self {
        Self {
            max_chain_length: config.max_chain_length,
            ..Self::default()
        }
    }
}

/// Status of one certificate in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Checks passed.
    Valid,
    /// Self-signed and in the trust anchor set.
    TrustedRoot,
    /// Terminal certificate that is not a trusted anchor.
    UntrustedRoot,
    /// Outside its validity window.
    Expired,
    /// Signature does not verify under the issuer key.
    SignatureInvalid,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Valid => "valid",
            NodeStatus::TrustedRoot => "trusted_root",
            NodeStatus::UntrustedRoot => "untrusted_root",
            NodeStatus::Expired => "expired",
            NodeStatus::SignatureInvalid => "signature_invalid",
        };
        f.write_str(name)
    }
}

/// One certificate of the walked chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainNode {
    /// Subject DN.
    pub subject: String,
    /// Issuer DN.
    pub issuer: String,
    /// Serial, lowercase hex.
    pub serial: String,
    /// SHA-256 fingerprint.
    pub fingerprint: String,
    /// notBefore (unix seconds).
    pub not_before: u64,
    /// notAfter (unix seconds).
    pub not_after: u64,
    /// basicConstraints cA.
    pub is_ca: bool,
    /// Classification.
    pub status: NodeStatus,
}

/// How bad an issue is. Only errors make a chain invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Makes the chain invalid.
    Error,
    /// Recorded only.
    Warning,
}

/// A finding about the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainIssue {
    /// Node the issue is about, leaf = 0.
    pub index: Option<usize>,
    /// Severity.
    pub severity: Severity,
    /// Description.
    pub message: String,
}

impl fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match self.index {
            Some(index) => write!(f, "{level} [{index}]: {}", self.message),
            None => write!(f, "{level}: {}", self.message),
        }
    }
}

/// Who is at either end of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainMetadata {
    /// Subject of the terminal certificate.
    pub root_subject: String,
    /// Certificates between leaf and terminal certificate.
    pub intermediate_count: usize,
    /// Subject of the leaf.
    pub end_entity_subject: String,
}

/// Result of [`validate_chain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainValidation {
    /// No error-severity issue was found.
    pub is_valid: bool,
    /// Every node is inside its validity window.
    pub expiration_valid: bool,
    /// Walked chain, leaf first.
    pub nodes: Vec<ChainNode>,
    /// Findings in walk order.
    pub issues: Vec<ChainIssue>,
    /// Chain summary.
    pub metadata: Option<ChainMetadata>,
}

impl ChainValidation {
    /// Error-severity issues only.
    pub fn errors(&self) -> impl Iterator<Item = &ChainIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }
}

// ============================================================================
// Validation
// ============================================================================

struct Issues(Vec<ChainIssue>);

impl Issues {
    fn error(&mut self, index: impl Into<Option<usize>>, message: impl Into<String>) {
        self.0.push(ChainIssue {
            index: index.into(),
            severity: Severity::Error,
            message: message.into(),
        });
    }

    fn warning(&mut self, index: impl Into<Option<usize>>, message: impl Into<String>) {
        self.0.push(ChainIssue {
            index: index.into(),
            severity: Severity::Warning,
            message: message.into(),
        });
    }
}

fn is_self_issued(cert: &Certificate) -> bool {
    cert.tbs_certificate.issuer == cert.tbs_certificate.subject
}

fn subject_key_id(cert: &Certificate) -> Option<Vec<u8>> {
    match certificate_extension::<SubjectKeyIdentifier>(cert) {
        Ok(Some((_, ski))) => Some(ski.0.as_bytes().to_vec()),
        _ => None,
    }
}

fn authority_key_id(cert: &Certificate) -> Option<Vec<u8>> {
    match certificate_extension::<AuthorityKeyIdentifier>(cert) {
        Ok(Some((_, aki))) => aki.key_identifier.map(|id| id.as_bytes().to_vec()),
        _ => None,
    }
}

/// Picks the issuer of `cert` among `candidates`: subject must equal the
/// issuer name; a matching key identifier wins over order.
fn find_issuer<'a>(
    cert: &Certificate,
    candidates: &'a [(Vec<u8>, Certificate)],
    path: &[Vec<u8>],
) -> Option<&'a (Vec<u8>, Certificate)> {
    let wanted = authority_key_id(cert);
    let mut fallback = None;

    for candidate in candidates {
        if path.contains(&candidate.0)
            || candidate.1.tbs_certificate.subject != cert.tbs_certificate.issuer
        {
            continue;
        }
        match (&wanted, subject_key_id(&candidate.1)) {
            (Some(aki), Some(ski)) if *aki == ski => return Some(candidate),
            (Some(_), Some(_)) => {},
            _ => {
                if fallback.is_none() {
                    fallback = Some(candidate);
                }
            },
        }
    }
    fallback
}

/// Validates the chain from `leaf` using `intermediates` and `anchors`.
///
/// Fails only with [`PkiError::ChainTooLong`] (and on undecodable input);
/// everything else is reported in the result.
pub fn validate_chain(
    leaf: &Certificate,
    intermediates: &[Certificate],
    anchors: &TrustAnchorSet,
    options: &ValidationOptions,
    now: u64,
) -> Result<ChainValidation> {
    let at = options.at.unwrap_or(now);
    let max = options.max_chain_length;

    let mut candidates = Vec::with_capacity(intermediates.len() + anchors.len());
    for cert in intermediates {
        candidates.push((cert.to_der()?, cert.clone()));
    }
    candidates.extend(anchors.anchors.iter().cloned());

    // Walk
    let mut path = vec![leaf.to_der()?];
    let mut chain = vec![leaf.clone()];
    if max == 0 {
        return Err(PkiError::ChainTooLong { length: 1, max });
    }
    loop {
        let Some(current) = chain.last() else { break };
        if is_self_issued(current) {
            break;
        }
        let Some((der, issuer)) = find_issuer(current, &candidates, &path) else {
            break;
        };
        if chain.len() >= max {
            return Err(PkiError::ChainTooLong {
                length: chain.len() + 1,
                max,
            });
        }
        path.push(der.clone());
        chain.push(issuer.clone());
    }

    let mut issues = Issues(Vec::new());
    let mut nodes = Vec::with_capacity(chain.len());
    let mut expiration_valid = true;
    let last = chain.len() - 1;

    for (index, cert) in chain.iter().enumerate() {
        let tbs = &cert.tbs_certificate;
        let not_before = x509::from_time(&tbs.validity.not_before);
        let not_after = x509::from_time(&tbs.validity.not_after);
        let basic = certificate_extension::<BasicConstraints>(cert).ok().flatten();
        let is_ca = basic.as_ref().is_some_and(|(_, bc)| bc.ca);

        // Signature
        let issuer_cert = if index < last {
            Some(&chain[index + 1])
        } else if is_self_issued(cert) {
            Some(cert)
        } else {
            issues.error(
                index,
                format!("issuer '{}' not found", display_name(&tbs.issuer)),
            );
            None
        };
        let signature_ok = match issuer_cert.map(public_key_of) {
            Some(Ok(key)) => match verify_certificate(cert, &key) {
                Ok(()) => true,
                Err(reason) => {
                    issues.error(index, format!("signature does not verify: {reason}"));
                    false
                },
            },
            Some(Err(e)) => {
                issues.error(index, format!("issuer key unusable: {e}"));
                false
            },
            None => false,
        };

        // Validity window
        let in_time = not_before <= at && at <= not_after;
        if !in_time {
            expiration_valid = false;
            if at < not_before {
                issues.error(index, format!("not valid before {not_before}"));
            } else {
                issues.error(index, format!("expired at {not_after}"));
            }
        }

        // Issuer constraints
        if index > 0 {
            if !is_ca {
                issues.error(index, "issuer certificate is not a CA (basicConstraints cA unset)");
            }
            if let Some(path_len) = basic.as_ref().and_then(|(_, bc)| bc.path_len_constraint) {
                let below = index - 1;
                if below > usize::from(path_len) {
                    issues.error(
                        index,
                        format!(
                            "pathLenConstraint {path_len} exceeded: {below} intermediate CAs below"
                        ),
                    );
                }
            }
            if options.check_key_usage {
                match certificate_extension::<KeyUsage>(cert) {
                    Ok(Some((_, ku))) if ku.0.contains(KeyUsages::KeyCertSign) => {},
                    _ => issues.error(index, "issuer certificate does not assert keyCertSign"),
                }
            }
            check_name_constraints(&mut issues, index, cert, &chain[..index]);
        }

        if options.validate_extensions {
            check_extensions(&mut issues, index, cert, index == last && is_self_issued(cert));
            check_algorithms(&mut issues, index, cert);
        }

        // Root classification
        let trusted = index == last
            && is_self_issued(cert)
            && signature_ok
            && anchors.contains(&path[index]);
        if index == last && !trusted {
            let message = format!(
                "root '{}' is not a trusted anchor",
                display_name(&tbs.subject)
            );
            if options.require_trusted_root {
                issues.error(index, message);
            } else {
                issues.warning(index, message);
            }
        }

        let status = if !signature_ok && issuer_cert.is_some() {
            NodeStatus::SignatureInvalid
        } else if !in_time {
            NodeStatus::Expired
        } else if index == last && trusted {
            NodeStatus::TrustedRoot
        } else if index == last {
            NodeStatus::UntrustedRoot
        } else {
            NodeStatus::Valid
        };

        nodes.push(ChainNode {
            subject: display_name(&tbs.subject),
            issuer: display_name(&tbs.issuer),
            serial: serial_hex(&tbs.serial_number),
            fingerprint: fingerprint(&path[index]),
            not_before,
            not_after,
            is_ca,
            status,
        });
    }

    let metadata = Some(ChainMetadata {
        root_subject: nodes[last].subject.clone(),
        intermediate_count: chain.len().saturating_sub(2),
        end_entity_subject: nodes[0].subject.clone(),
    });
    let issues = issues.0;

    Ok(ChainValidation {
        is_valid: !issues.iter().any(|i| i.severity == Severity::Error),
        expiration_valid,
        nodes,
        issues,
        metadata,
    })
}

/// Required extensions and their criticality.
fn check_extensions(issues: &mut Issues, index: usize, cert: &Certificate, self_signed_root: bool) {
    let extensions = cert.tbs_certificate.extensions.as_ref();
    let find = |oid| x509::find_extension(extensions, oid);
    let is_ca = certificate_extension::<BasicConstraints>(cert)
        .ok()
        .flatten()
        .is_some_and(|(_, bc)| bc.ca);

    match find(OID_BASIC_CONSTRAINTS) {
        None => issues.error(index, "basicConstraints is missing"),
        Some(ext) if is_ca && !ext.critical => {
            issues.error(index, "basicConstraints must be critical on CA certificates")
        },
        Some(_) => {},
    }
    match find(OID_KEY_USAGE) {
        None => issues.error(index, "keyUsage is missing"),
        Some(ext) if !ext.critical => issues.warning(index, "keyUsage should be critical"),
        Some(_) => {},
    }
    match find(OID_SUBJECT_KEY_ID) {
        None if is_ca => issues.error(index, "subjectKeyIdentifier is missing"),
        None => issues.warning(index, "subjectKeyIdentifier is missing"),
        Some(ext) if ext.critical => {
            issues.error(index, "subjectKeyIdentifier must not be critical")
        },
        Some(_) => {},
    }
    match find(OID_AUTHORITY_KEY_ID) {
        None if !self_signed_root => issues.error(index, "authorityKeyIdentifier is missing"),
        Some(ext) if ext.critical => {
            issues.error(index, "authorityKeyIdentifier must not be critical")
        },
        _ => {},
    }

    for ext in extensions.into_iter().flatten() {
        if ext.critical && !KNOWN_CERTIFICATE_EXTENSIONS.contains(&ext.extn_id) {
            issues.error(index, format!("unrecognized critical extension {}", ext.extn_id));
        }
    }
}

/// Flags short RSA keys, unsupported key types and SHA-1/MD5 signatures.
fn check_algorithms(issues: &mut Issues, index: usize, cert: &Certificate) {
    match public_key_of(cert).map(|key| key.algorithm()) {
        Ok(KeyAlgorithm::Rsa { bits }) if bits < MIN_RSA_BITS => {
            issues.warning(index, format!("weak key: RSA-{bits} is below {MIN_RSA_BITS} bits"))
        },
        Ok(_) => {},
        Err(_) => {
            let algorithm = &cert.tbs_certificate.subject_public_key_info.algorithm;
            let curve = algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.decode_as::<ObjectIdentifier>().ok());
            match curve {
                Some(curve) => issues.warning(index, format!("weak key: unapproved curve {curve}")),
                None => issues.warning(index, format!("unsupported key algorithm {}", algorithm.oid)),
            }
        },
    }

    let oid = cert.signature_algorithm.oid;
    if let Some((_, name)) = WEAK_SIGNATURE_ALGORITHMS.iter().find(|(weak, _)| *weak == oid) {
        issues.warning(index, format!("weak signature algorithm {name}"));
    }
}

// ============================================================================
// Name constraints
// ============================================================================

fn dns_within(name: &str, constraint: &str) -> bool {
    let name = name.trim_start_matches("*.").to_ascii_lowercase();
    let constraint = constraint.to_ascii_lowercase();
    if let Some(suffix) = constraint.strip_prefix('.') {
        return name.ends_with(&format!(".{suffix}"));
    }
    name == constraint || name.ends_with(&format!(".{constraint}"))
}

fn ip_within(ip: &IpAddr, constraint: &[u8]) -> bool {
    let address = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    if constraint.len() != address.len() * 2 {
        return false;
    }
    let (network, mask) = constraint.split_at(address.len());
    address
        .iter()
        .zip(network)
        .zip(mask)
        .all(|((a, n), m)| a & m == n & m)
}

/// `Some(true/false)` when `base` speaks about names of `san`'s kind.
fn subtree_matches(base: &GeneralName, san: &SanEntry) -> Option<bool> {
    match (base, san) {
        (GeneralName::DnsName(domain), SanEntry::Dns(name) | SanEntry::WildcardDns(name)) => {
            Some(dns_within(name, &domain.to_string()))
        },
        (GeneralName::IpAddress(range), SanEntry::Ip(ip)) => {
            Some(ip_within(ip, range.as_bytes()))
        },
        _ => None,
    }
}

fn sans_of(cert: &Certificate) -> Vec<SanEntry> {
    match certificate_extension::<SubjectAltName>(cert) {
        Ok(Some((_, san))) => san.0.iter().filter_map(SanEntry::from_general_name).collect(),
        _ => Vec::new(),
    }
}

/// Applies the name constraints of `ca` to the SANs of every certificate
/// below it.
fn check_name_constraints(issues: &mut Issues, index: usize, ca: &Certificate, below: &[Certificate]) {
    let constraints = match certificate_extension::<NameConstraints>(ca) {
        Ok(Some((_, nc))) => nc,
        Ok(None) => return,
        Err(e) => {
            issues.error(index, format!("nameConstraints unreadable: {e}"));
            return;
        },
    };
    let permitted = constraints.permitted_subtrees.unwrap_or_default();
    let excluded = constraints.excluded_subtrees.unwrap_or_default();

    for (subordinate, cert) in below.iter().enumerate() {
        for san in sans_of(cert) {
            let applicable: Vec<bool> = permitted
                .iter()
                .filter_map(|subtree| subtree_matches(&subtree.base, &san))
                .collect();
            if !applicable.is_empty() && !applicable.contains(&true) {
                issues.error(
                    subordinate,
                    format!("'{san}' is outside the permitted subtrees of node {index}"),
                );
            }
            if excluded
                .iter()
                .any(|subtree| subtree_matches(&subtree.base, &san) == Some(true))
            {
                issues.error(
                    subordinate,
                    format!("'{san}' falls in an excluded subtree of node {index}"),
                );
            }
        }
    }
}

// ============================================================================
// Cached validator
// ============================================================================

struct CacheEntry {
    result: ChainValidation,
    expires_at: u64,
}

/// Validates chains against a trust anchor snapshot, caching results.
///
/// Entries are keyed on the leaf, the intermediates, the anchor set hash and
/// the options. They expire after the TTL or at the next notBefore/notAfter
/// boundary of a node, whichever comes first, and the whole cache is dropped
/// when the anchor set changes.
pub struct ChainValidator {
    anchors: RwLock<Arc<TrustAnchorSet>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: u64,
    capacity: usize,
}

impl ChainValidator {
    /// Validator with an empty anchor set.
    pub fn new(config: &PkiConfig) -> Self {
        Self {
            anchors: RwLock::new(Arc::new(TrustAnchorSet::empty())),
            cache: Mutex::new(HashMap::new()),
            ttl: config.chain_cache_ttl_secs,
            capacity: config.chain_cache_capacity,
        }
    }

    /// Current anchor snapshot.
    pub fn trust_anchors(&self) -> Arc<TrustAnchorSet> {
        self.anchors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the anchors and drops every cached result if they changed.
    pub fn set_trust_anchors(&self, anchors: TrustAnchorSet) {
        let mut current = self.anchors.write().unwrap_or_else(|e| e.into_inner());
        if current.hash == anchors.hash {
            return;
        }
        debug!(anchors = anchors.len(), hash = %anchors.hash(), "Trust anchors replaced");
        *current = Arc::new(anchors);
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of cached results.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Validates, serving from cache when possible.
    pub fn validate(
        &self,
        leaf: &Certificate,
        intermediates: &[Certificate],
        options: &ValidationOptions,
        now: u64,
    ) -> Result<ChainValidation> {
        let anchors = self.trust_anchors();
        let key = cache_key(leaf, intermediates, &anchors, options)?;

        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(&key) {
                if now < entry.expires_at {
                    return Ok(entry.result.clone());
                }
            }
        }

        let result = validate_chain(leaf, intermediates, &anchors, options, now)?;
        if self.capacity == 0 || self.ttl == 0 {
            return Ok(result);
        }

        let mut expires_at = now.saturating_add(self.ttl);
        if options.at.is_none() {
            for node in &result.nodes {
                let boundary = if now < node.not_before {
                    node.not_before
                } else {
                    node.not_after.saturating_add(1)
                };
                if boundary > now {
                    expires_at = expires_at.min(boundary);
                }
            }
        }

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= self.capacity {
            cache.retain(|_, entry| entry.expires_at > now);
        }
        if cache.len() >= self.capacity {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key,
            CacheEntry {
                result: result.clone(),
                expires_at,
            },
        );

        Ok(result)
    }
}

fn cache_key(
    leaf: &Certificate,
    intermediates: &[Certificate],
    anchors: &TrustAnchorSet,
    options: &ValidationOptions,
) -> Result<String> {
    let mut material = Vec::new();
    for cert in intermediates {
        material.extend_from_slice(&sha256(&cert.to_der()?));
    }
    Ok(format!(
        "{}|{}|{}|{}|{}|{}|{}|{:?}",
        hex::encode(sha256(&leaf.to_der()?)),
        hex::encode(sha256(&material)),
        anchors.hash(),
        options.max_chain_length,
        options.require_trusted_root,
        options.check_key_usage,
        options.validate_extensions,
        options.at,
    ))
}

// ============================================================================
// Engine integration
// ============================================================================

impl PkiEngine {
    /// Self-signed certificates of every active CA.
    pub async fn trust_anchors(&self) -> Result<TrustAnchorSet> {
        let mut roots = Vec::new();
        for ca in self.store.list_cas().await? {
            if !ca.can_sign() {
                continue;
            }
            if let Some(pem) = &ca.certificate_pem {
                let cert = parse_certificate(pem.as_bytes())?;
                if is_self_issued(&cert) {
                    roots.push(cert);
                }
            }
        }
        TrustAnchorSet::new(roots)
    }

    /// Validates `leaf` (PEM or DER) against the engine's CAs.
    ///
    /// Active self-signed CAs are the trust anchors; every other stored CA
    /// certificate, plus `extra_intermediates`, is available for the walk.
    pub async fn validate_chain(
        &self,
        leaf: &[u8],
        extra_intermediates: &[Certificate],
        options: &ValidationOptions,
    ) -> Result<ChainValidation> {
        let leaf = parse_certificate(leaf)?;

        let mut intermediates = extra_intermediates.to_vec();
        for ca in self.store.list_cas().await? {
            for pem in ca.certificate_pem.iter().chain(&ca.chain_pem) {
                let cert = parse_certificate(pem.as_bytes())?;
                if !is_self_issued(&cert) {
                    intermediates.push(cert);
                }
            }
        }

        self.chains.set_trust_anchors(self.trust_anchors().await?);
        self.chains.validate(&leaf, &intermediates, options, Self::now())
    }
}
