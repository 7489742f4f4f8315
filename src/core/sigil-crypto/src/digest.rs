//! SHA-256 helpers for fingerprints and key identifiers.

use sha2::{Digest, Sha256};

/// Length of subject/authority key identifiers in bytes.
pub const KEY_IDENTIFIER_SIZE: usize = 20;

/// Computes the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Formats the SHA-256 fingerprint of a DER structure as `AB:CD:...`.
pub fn fingerprint(der: &[u8]) -> String {
    let hex = hex::encode_upper(sha256(der));
    let mut out = String::with_capacity(hex.len() + hex.len() / 2);
    for (i, pair) in hex.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push(pair[0] as char);
        out.push(pair[1] as char);
    }
    out
}

/// Key identifier over the subjectPublicKey bits: the leftmost 160 bits
/// of its SHA-256 hash (RFC 7093, method 1).
pub fn key_identifier(subject_public_key: &[u8]) -> Vec<u8> {
    sha256(subject_public_key)[..KEY_IDENTIFIER_SIZE].to_vec()
}
