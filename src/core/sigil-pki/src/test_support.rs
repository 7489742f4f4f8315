//! Shared fixtures for engine tests.

#![allow(clippy::disallowed_methods)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sigil_crypto::WrappingKey;
use sigil_storage::{MemoryBackend, StorageBackend, StorageError};

use crate::audit::MemoryAuditSink;
use crate::authority::CreateCaRequest;
use crate::config::PkiConfig;
use crate::engine::PkiEngine;
use crate::issuance::{IssueRequest, IssuedCertificate};
use crate::profile::CertificateProfile;
use crate::types::CaConfig;

pub(crate) const ACTOR: &str = "user:test";

/// Engine over an in-memory store, recording audit events.
pub(crate) fn setup() -> (PkiEngine, Arc<MemoryAuditSink>) {
    setup_with(Arc::new(MemoryBackend::new()), PkiConfig::default())
}

pub(crate) fn setup_with(
    backend: Arc<dyn StorageBackend>,
    config: PkiConfig,
) -> (PkiEngine, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = PkiEngine::new(backend, &WrappingKey::generate(), config)
        .unwrap()
        .with_audit(audit.clone());
    (engine, audit)
}

/// Creates and self-signs a P-256 root.
pub(crate) async fn root_ca(engine: &PkiEngine, id: &str, path_len: Option<u8>) -> CaConfig {
    let request = CreateCaRequest {
        crl_url: Some(format!("http://crl.example.com/{id}.crl")),
        ..CreateCaRequest::new(id, format!("CN={id} Root,O=Sigil Test"))
    };
    engine.create_ca(request, ACTOR).await.unwrap();
    engine.self_sign_ca(id, 3650, path_len, ACTOR).await.unwrap()
}

/// Issues a server certificate for `cn` with a generated P-256 key.
pub(crate) async fn issue_server(engine: &PkiEngine, ca_id: &str, cn: &str) -> IssuedCertificate {
    let profile = CertificateProfile::server(&[cn]).unwrap();
    let request = IssueRequest::new(ca_id, format!("CN={cn}"), profile);
    engine.issue(request, ACTOR).await.unwrap()
}

/// Backend whose create-only inserts under one prefix conflict while armed.
pub(crate) struct ConflictingBackend {
    inner: MemoryBackend,
    prefix: &'static str,
    armed: AtomicBool,
}

impl ConflictingBackend {
    pub(crate) fn new(prefix: &'static str) -> Self {
        Self {
            inner: MemoryBackend::new(),
            prefix,
            armed: AtomicBool::new(true),
        }
    }

    pub(crate) fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for ConflictingBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.put(key, value).await
    }

    async fn insert(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.armed.load(Ordering::SeqCst) && key.starts_with(self.prefix) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        self.inner.insert(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }
}
