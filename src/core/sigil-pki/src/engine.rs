//! The async orchestration layer.
//!
//! [`PkiEngine`] ties the pure builders (keys, CSRs, extensions, certificates,
//! CRLs, chains) to the record store. Operations that touch the same CA are
//! serialized through a per-CA lock so serial reservation, CRL numbering and
//! status transitions stay consistent; different CAs proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use sigil_crypto::WrappingKey;
use sigil_storage::StorageBackend;

use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::chain::ChainValidator;
use crate::config::PkiConfig;
use crate::envelope::EnvelopeCipher;
use crate::error::{PkiError, Result};
use crate::store::PkiStore;
use crate::types::{CaConfig, CertificateRecord, CrlRecord, RevocationRecord};
use crate::x509;

/// Certificate authority engine.
pub struct PkiEngine {
    pub(crate) store: PkiStore,
    envelope: RwLock<Arc<EnvelopeCipher>>,
    pub(crate) config: PkiConfig,
    audit: Arc<dyn AuditSink>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Held shared by operations that wrap keys, exclusively by rotation.
    pub(crate) rotation: tokio::sync::RwLock<()>,
    pub(crate) chains: ChainValidator,
}

impl PkiEngine {
    /// Creates an engine over `backend`, wrapping keys with `wrapping_key`.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        wrapping_key: &WrappingKey,
        config: PkiConfig,
    ) -> Result<Self> {
        let envelope = EnvelopeCipher::new(wrapping_key)?;
        debug!(key_id = %envelope.key_id(), "PKI engine initialized");

        Ok(Self {
            store: PkiStore::new(backend),
            envelope: RwLock::new(Arc::new(envelope)),
            chains: ChainValidator::new(&config),
            config,
            audit: Arc::new(TracingAuditSink),
            locks: Mutex::new(HashMap::new()),
            rotation: tokio::sync::RwLock::new(()),
        })
    }

    /// Replaces the audit sink.
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &PkiConfig {
        &self.config
    }

    /// Id of the wrapping key new records are wrapped with.
    pub fn wrapping_key_id(&self) -> String {
        self.cipher().key_id().to_string()
    }

    pub(crate) fn now() -> u64 {
        x509::now()
    }

    /// Snapshot of the envelope cipher.
    pub(crate) fn cipher(&self) -> Arc<EnvelopeCipher> {
        self.envelope
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_cipher(&self, cipher: EnvelopeCipher) {
        *self.envelope.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(cipher);
    }

    /// Lock serializing state changes of one CA.
    pub(crate) fn ca_lock(&self, ca_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(ca_id.to_string())
            .or_default()
            .clone()
    }

    /// Hands an event to the audit sink. Failures are logged, never returned.
    pub(crate) async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event).await {
            warn!(action = %event.action, error = %e, "Failed to record audit event");
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Loads a CA.
    pub async fn get_ca(&self, ca_id: &str) -> Result<CaConfig> {
        self.store.require_ca(ca_id).await
    }

    /// All CAs, ordered by id.
    pub async fn list_cas(&self) -> Result<Vec<CaConfig>> {
        self.store.list_cas().await
    }

    /// Loads a certificate by serial.
    ///
    /// The returned status has expiry applied as of now.
    pub async fn get_certificate(&self, serial: &str) -> Result<CertificateRecord> {
        let serial = normalize_serial(serial);
        let mut record = self
            .store
            .find_certificate(&serial)
            .await?
            .ok_or_else(|| PkiError::CertificateNotFound(serial.clone()))?;
        record.status = record.effective_status(Self::now());
        Ok(record)
    }

    /// Certificates issued by `ca_id`, with expiry applied as of now.
    pub async fn list_certificates(&self, ca_id: &str) -> Result<Vec<CertificateRecord>> {
        self.store.require_ca(ca_id).await?;
        let now = Self::now();
        let mut records = self.store.list_certificates(ca_id).await?;
        for record in &mut records {
            record.status = record.effective_status(now);
        }
        Ok(records)
    }

    /// Revocations recorded for `ca_id`, including `REMOVE_FROM_CRL` ones.
    pub async fn list_revocations(&self, ca_id: &str) -> Result<Vec<RevocationRecord>> {
        self.store.require_ca(ca_id).await?;
        self.store.list_revocations(ca_id).await
    }

    /// CRLs generated for `ca_id`, ascending by number.
    pub async fn list_crls(&self, ca_id: &str) -> Result<Vec<CrlRecord>> {
        self.store.require_ca(ca_id).await?;
        self.store.list_crls(ca_id).await
    }

    /// Most recent CRL of `ca_id`, full or delta.
    pub async fn latest_crl(&self, ca_id: &str) -> Result<Option<CrlRecord>> {
        Ok(self.list_crls(ca_id).await?.pop())
    }
}

/// Lowercase hex without separators or leading zero octet.
pub(crate) fn normalize_serial(serial: &str) -> String {
    let hex: String = serial
        .chars()
        .filter(|c| !matches!(c, ':' | ' '))
        .collect::<String>()
        .to_ascii_lowercase();
    let hex = hex.strip_prefix("0x").unwrap_or(&hex);
    match hex.strip_prefix("00") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => hex.to_string(),
    }
}

impl std::fmt::Debug for PkiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkiEngine")
            .field("envelope", &self.cipher())
            .field("config", &self.config)
            .finish()
    }
}
