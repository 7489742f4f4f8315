//! Signing with envelope-protected CA keys.
//!
//! A CA's private key exists in plaintext only inside [`with_signing_key`].
//! The closure is synchronous, so the key can never be held across an await
//! point, and both the PKCS#8 buffer and the parsed key are zeroized when the
//! scope ends, on success and on error alike.

use der::asn1::BitString;
use der::Encode;
use spki::AlgorithmIdentifierOwned;
use x509_cert::certificate::{CertificateInner, TbsCertificateInner};
use x509_cert::crl::{CertificateList, TbsCertList};
use x509_cert::Certificate;

use sigil_crypto::{PrivateKey, PublicKey, SignatureScheme};

use crate::envelope::{EnvelopeCipher, WrappedKey};
use crate::error::Result;

/// Decrypts `wrapped`, hands the key to `f`, then discards it.
pub(crate) fn with_signing_key<T>(
    cipher: &EnvelopeCipher,
    wrapped: &WrappedKey,
    f: impl FnOnce(&PrivateKey) -> Result<T>,
) -> Result<T> {
    let pkcs8 = cipher.unwrap(wrapped)?;
    let key = PrivateKey::from_pkcs8_der(&pkcs8)?;
    f(&key)
}

/// Signs a to-be-signed certificate body.
pub(crate) fn sign_certificate(
    tbs_certificate: TbsCertificateInner,
    key: &PrivateKey,
) -> Result<Certificate> {
    let signature = key.sign(&tbs_certificate.to_der()?)?;
    Ok(CertificateInner {
        signature_algorithm: tbs_certificate.signature.clone(),
        tbs_certificate,
        signature: BitString::from_bytes(&signature)?,
    })
}

/// Signs a to-be-signed CRL body.
pub(crate) fn sign_crl(tbs_cert_list: TbsCertList, key: &PrivateKey) -> Result<CertificateList> {
    let signature = key.sign(&tbs_cert_list.to_der()?)?;
    Ok(CertificateList {
        signature_algorithm: tbs_cert_list.signature.clone(),
        tbs_cert_list,
        signature: BitString::from_bytes(&signature)?,
    })
}

/// Verifies a signature over `tbs_der` made with `algorithm`.
///
/// Returns a human-readable reason on failure, for issue lists.
pub(crate) fn verify_signature(
    public_key: &PublicKey,
    algorithm: &AlgorithmIdentifierOwned,
    tbs_der: &[u8],
    signature: &BitString,
) -> std::result::Result<(), String> {
    let scheme = SignatureScheme::from_oid(algorithm.oid)
        .ok_or_else(|| format!("unsupported signature algorithm {}", algorithm.oid))?;
    let signature = signature
        .as_bytes()
        .ok_or_else(|| "signature has unused bits".to_string())?;

    public_key
        .verify(scheme, tbs_der, signature)
        .map_err(|e| e.to_string())
}

/// Verifies that `cert` was signed by `issuer_key`.
pub(crate) fn verify_certificate(
    cert: &Certificate,
    issuer_key: &PublicKey,
) -> std::result::Result<(), String> {
    if cert.signature_algorithm != cert.tbs_certificate.signature {
        return Err("outer and inner signature algorithms differ".into());
    }
    let tbs = cert.tbs_certificate.to_der().map_err(|e| e.to_string())?;
    verify_signature(issuer_key, &cert.signature_algorithm, &tbs, &cert.signature)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::error::PkiError;
    use sigil_crypto::{EcCurve, KeyAlgorithm, WrappingKey};

    #[test]
    fn test_with_signing_key_signs_and_verifies() {
        let cipher = EnvelopeCipher::new(&WrappingKey::generate()).unwrap();
        let key = PrivateKey::generate(KeyAlgorithm::Ecdsa {
            curve: EcCurve::P256,
        })
        .unwrap();
        let public = key.public_key().unwrap();
        let wrapped = cipher.wrap(key.pkcs8_der()).unwrap();

        let signature = with_signing_key(&cipher, &wrapped, |k| Ok(k.sign(b"tbs")?)).unwrap();

        public
            .verify(SignatureScheme::EcdsaSha256, b"tbs", &signature)
            .unwrap();
    }

    #[test]
    fn test_with_signing_key_propagates_tampering() {
        let cipher = EnvelopeCipher::new(&WrappingKey::generate()).unwrap();
        let key = PrivateKey::generate(KeyAlgorithm::Ed25519).unwrap();
        let mut wrapped = cipher.wrap(key.pkcs8_der()).unwrap();
        wrapped.ciphertext[0] ^= 0xff;

        let mut called = false;
        let result = with_signing_key(&cipher, &wrapped, |_| {
            called = true;
            Ok(())
        });

        assert!(matches!(result, Err(PkiError::DecryptionFailed(_))));
        assert!(!called);
    }
}
