//! Typed record layer over a [`StorageBackend`].
//!
//! Records are JSON documents under these keys:
//!
//! | Key | Record |
//! |-----|--------|
//! | `ca/<id>` | [`CaConfig`] |
//! | `cert/<ca>/<serial>` | [`CertificateRecord`] |
//! | `serial/<serial>` | owning CA id, reserved create-only |
//! | `revocation/<ca>/<serial>` | [`RevocationRecord`], create-only |
//! | `crl/<ca>/<number>` | [`CrlRecord`], number zero-padded to 20 digits |

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use sigil_storage::{StorageBackend, StorageError};

use crate::error::{PkiError, Result};
use crate::types::{CaConfig, CertificateRecord, CrlRecord, RevocationRecord};

/// JSON record store.
#[derive(Clone)]
pub struct PkiStore {
    backend: Arc<dyn StorageBackend>,
}

fn ca_key(id: &str) -> String {
    format!("ca/{id}")
}

fn cert_key(ca_id: &str, serial: &str) -> String {
    format!("cert/{ca_id}/{serial}")
}

fn serial_key(serial: &str) -> String {
    format!("serial/{serial}")
}

fn revocation_key(ca_id: &str, serial: &str) -> String {
    format!("revocation/{ca_id}/{serial}")
}

fn crl_key(ca_id: &str, number: u64) -> String {
    format!("crl/{ca_id}/{number:020}")
}

impl PkiStore {
    /// Wraps a storage backend.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.backend.put(key, &serde_json::to_vec(value)?).await?;
        Ok(())
    }

    async fn create<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.backend.insert(key, &serde_json::to_vec(value)?).await?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let keys = self.backend.list(prefix).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.read(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    // ========================================================================
    // CAs
    // ========================================================================

    /// Loads a CA.
    pub async fn get_ca(&self, id: &str) -> Result<Option<CaConfig>> {
        self.read(&ca_key(id)).await
    }

    /// Loads a CA, failing with [`PkiError::CaNotFound`] when absent.
    pub async fn require_ca(&self, id: &str) -> Result<CaConfig> {
        self.get_ca(id)
            .await?
            .ok_or_else(|| PkiError::CaNotFound(id.to_string()))
    }

    /// Persists a new CA, failing with [`PkiError::CaAlreadyExists`] on a
    /// taken id.
    pub async fn insert_ca(&self, ca: &CaConfig) -> Result<()> {
        match self.create(&ca_key(&ca.id), ca).await {
            Err(PkiError::Storage(StorageError::AlreadyExists(_))) => {
                Err(PkiError::CaAlreadyExists(ca.id.clone()))
            },
            other => other,
        }
    }

    /// Overwrites a CA.
    pub async fn put_ca(&self, ca: &CaConfig) -> Result<()> {
        self.write(&ca_key(&ca.id), ca).await
    }

    /// Removes a CA record.
    pub async fn delete_ca(&self, id: &str) -> Result<()> {
        Ok(self.backend.delete(&ca_key(id)).await?)
    }

    /// All CAs, ordered by id.
    pub async fn list_cas(&self) -> Result<Vec<CaConfig>> {
        self.read_all("ca/").await
    }

    // ========================================================================
    // Serials and certificates
    // ========================================================================

    /// Claims `serial` for `ca_id`.
    ///
    /// Returns `false` when another certificate already holds the serial.
    pub async fn reserve_serial(&self, serial: &str, ca_id: &str) -> Result<bool> {
        match self.backend.insert(&serial_key(serial), ca_id.as_bytes()).await {
            Ok(()) => Ok(true),
            Err(StorageError::AlreadyExists(_)) => {
                debug!(serial = %serial, "Serial collision");
                Ok(false)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// CA that reserved `serial`.
    pub async fn serial_owner(&self, serial: &str) -> Result<Option<String>> {
        match self.backend.get(&serial_key(serial)).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string()).into()),
            None => Ok(None),
        }
    }

    /// Persists a newly issued certificate.
    pub async fn insert_certificate(&self, record: &CertificateRecord) -> Result<()> {
        self.create(&cert_key(&record.ca_id, &record.serial), record).await
    }

    /// Overwrites a certificate record.
    pub async fn put_certificate(&self, record: &CertificateRecord) -> Result<()> {
        self.write(&cert_key(&record.ca_id, &record.serial), record).await
    }

    /// Loads a certificate of `ca_id`.
    pub async fn get_certificate(
        &self,
        ca_id: &str,
        serial: &str,
    ) -> Result<Option<CertificateRecord>> {
        self.read(&cert_key(ca_id, serial)).await
    }

    /// Loads a certificate by serial alone, through the serial reservation.
    pub async fn find_certificate(&self, serial: &str) -> Result<Option<CertificateRecord>> {
        match self.serial_owner(serial).await? {
            Some(ca_id) => self.get_certificate(&ca_id, serial).await,
            None => Ok(None),
        }
    }

    /// All certificates of `ca_id`, ordered by serial.
    pub async fn list_certificates(&self, ca_id: &str) -> Result<Vec<CertificateRecord>> {
        self.read_all(&format!("cert/{ca_id}/")).await
    }

    // ========================================================================
    // Revocations
    // ========================================================================

    /// Persists a revocation.
    ///
    /// Returns `false` if the serial was revoked before; the existing record
    /// is left untouched.
    pub async fn insert_revocation(&self, record: &RevocationRecord) -> Result<bool> {
        match self.create(&revocation_key(&record.ca_id, &record.serial), record).await {
            Ok(()) => Ok(true),
            Err(PkiError::Storage(StorageError::AlreadyExists(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Loads the revocation of a serial.
    pub async fn get_revocation(
        &self,
        ca_id: &str,
        serial: &str,
    ) -> Result<Option<RevocationRecord>> {
        self.read(&revocation_key(ca_id, serial)).await
    }

    /// All revocations of `ca_id`.
    pub async fn list_revocations(&self, ca_id: &str) -> Result<Vec<RevocationRecord>> {
        self.read_all(&format!("revocation/{ca_id}/")).await
    }

    // ========================================================================
    // CRLs
    // ========================================================================

    /// Persists a CRL. CRL numbers are never reused.
    pub async fn insert_crl(&self, record: &CrlRecord) -> Result<()> {
        self.create(&crl_key(&record.ca_id, record.number), record).await
    }

    /// Loads a CRL by number.
    pub async fn get_crl(&self, ca_id: &str, number: u64) -> Result<Option<CrlRecord>> {
        self.read(&crl_key(ca_id, number)).await
    }

    /// All CRLs of `ca_id`, ascending by number.
    pub async fn list_crls(&self, ca_id: &str) -> Result<Vec<CrlRecord>> {
        self.read_all(&format!("crl/{ca_id}/")).await
    }

    /// Most recent full (non-delta) CRL.
    pub async fn latest_full_crl(&self, ca_id: &str) -> Result<Option<CrlRecord>> {
        Ok(self
            .list_crls(ca_id)
            .await?
            .into_iter()
            .rev()
            .find(|crl| !crl.is_delta()))
    }
}
