//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for issuance, CRL generation and chain validation.
///
/// Every field has a default, so a partial TOML file is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    /// Lifetime of a full CRL (`nextUpdate - thisUpdate`).
    pub crl_validity_hours: u32,
    /// Lifetime of a delta CRL.
    pub delta_crl_validity_hours: u32,
    /// Upper bound for requested certificate validity.
    pub max_validity_days: u32,
    /// Smallest RSA modulus accepted for issued certificates and CAs.
    pub min_rsa_bits: u32,
    /// Serial number candidates tried before giving up.
    pub serial_retry_limit: u32,
    /// Adds an issuingDistributionPoint extension to CRLs of CAs with a CRL URL.
    pub include_issuing_distribution_point: bool,
    /// Longest chain the validator will walk.
    pub max_chain_length: usize,
    /// How long a cached chain validation result may be reused.
    pub chain_cache_ttl_secs: u64,
    /// Maximum number of cached chain validation results.
    pub chain_cache_capacity: usize,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            crl_validity_hours: 24,
            delta_crl_validity_hours: 4,
            max_validity_days: 3650,
            min_rsa_bits: 2048,
            serial_retry_limit: 8,
            include_issuing_distribution_point: true,
            max_chain_length: 10,
            chain_cache_ttl_secs: 300,
            chain_cache_capacity: 1024,
        }
    }
}
