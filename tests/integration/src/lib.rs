//! Integration tests for Sigil.
//!
//! These tests drive the PKI engine over the SQLite backend, the way the CLI
//! runs it, from CA creation to CRLs, chain validation and key rotation.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tempfile::TempDir;

use sigil_crypto::WrappingKey;
use sigil_pki::{
    CaConfig, CertificateProfile, CreateCaRequest, IssueRequest, IssuedCertificate,
    MemoryAuditSink, PkiConfig, PkiEngine,
};
use sigil_storage_sqlite::SqliteBackend;

/// Actor recorded by the harness.
pub const ACTOR: &str = "user:integration";

// ============================================================================
// Test PKI
// ============================================================================

/// An engine over a SQLite database in its own temporary directory.
pub struct TestPki {
    pub engine: PkiEngine,
    pub audit: Arc<MemoryAuditSink>,
    pub wrapping_key: WrappingKey,
    data_dir: TempDir,
}

impl TestPki {
    /// Starts an engine over a fresh database with a new wrapping key.
    pub async fn start() -> Result<Self> {
        let data_dir = TempDir::new().context("Failed to create temp dir")?;
        let wrapping_key = WrappingKey::generate();
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = open_engine(data_dir.path(), &wrapping_key)
            .await?
            .with_audit(audit.clone());

        Ok(Self {
            engine,
            audit,
            wrapping_key,
            data_dir,
        })
    }

    /// Opens a second engine on the same database.
    pub async fn reopen(&self, wrapping_key: &WrappingKey) -> Result<PkiEngine> {
        open_engine(self.data_dir.path(), wrapping_key).await
    }

    /// Directory holding the database.
    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    /// Creates and self-signs a root CA.
    pub async fn root(&self, id: &str) -> Result<CaConfig> {
        let request = CreateCaRequest {
            crl_url: Some(format!("http://crl.example.com/{id}.crl")),
            ..CreateCaRequest::new(id, format!("CN={id},O=Sigil Integration"))
        };
        self.engine.create_ca(request, ACTOR).await?;
        Ok(self.engine.self_sign_ca(id, 3650, Some(1), ACTOR).await?)
    }

    /// Issues a server certificate with a generated key.
    pub async fn issue_server(&self, ca_id: &str, host: &str) -> Result<IssuedCertificate> {
        issue_server(&self.engine, ca_id, host).await
    }
}

async fn open_engine(data_dir: &Path, wrapping_key: &WrappingKey) -> Result<PkiEngine> {
    let backend = SqliteBackend::open(data_dir, "sigil")
        .await?
        .with_actor(ACTOR);
    Ok(PkiEngine::new(
        Arc::new(backend),
        wrapping_key,
        PkiConfig::default(),
    )?)
}

/// Issues a server certificate for `host` from `ca_id`.
pub async fn issue_server(
    engine: &PkiEngine,
    ca_id: &str,
    host: &str,
) -> Result<IssuedCertificate> {
    let profile = CertificateProfile::server(&[host])?;
    let request = IssueRequest::new(ca_id, format!("CN={host}"), profile);
    Ok(engine.issue(request, ACTOR).await?)
}

// ============================================================================
// CLI Runner
// ============================================================================

/// Runs the `sigil` binary against one data directory and wrapping key.
pub struct CliRunner {
    binary: PathBuf,
    data_dir: TempDir,
    wrapping_key: String,
}

impl CliRunner {
    /// Returns `None` when the binary has not been built.
    pub fn new() -> Result<Option<Self>> {
        let Some(binary) = find_cli_binary() else {
            return Ok(None);
        };
        Ok(Some(Self {
            binary,
            data_dir: TempDir::new().context("Failed to create temp dir")?,
            wrapping_key: BASE64.encode(WrappingKey::generate().as_bytes()),
        }))
    }

    /// Path inside the runner's data directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.data_dir.path().join(name)
    }

    /// Runs a command and returns its output, failing on a non-zero exit.
    pub fn run(&self, args: &[&str]) -> Result<Output> {
        let output = self.run_unchecked(args)?;
        if !output.status.success() {
            bail!(
                "sigil {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(output)
    }

    /// Runs a command whatever its exit status.
    pub fn run_unchecked(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .env("SIGIL_DATA_DIR", self.data_dir.path())
            .env("SIGIL_WRAPPING_KEY", &self.wrapping_key)
            .env("SIGIL_ACTOR", ACTOR)
            .env_remove("SIGIL_CONFIG")
            .env_remove("RUST_LOG")
            .output()
            .with_context(|| format!("Failed to run {:?}", self.binary))
    }
}

/// Find the CLI binary in the target directory.
fn find_cli_binary() -> Option<PathBuf> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());

    let candidates = [
        Path::new(&manifest_dir).join("../../target/debug/sigil"),
        Path::new(&manifest_dir).join("../../target/debug/sigil.exe"),
        Path::new(&manifest_dir).join("../../target/release/sigil"),
        Path::new(&manifest_dir).join("../../target/release/sigil.exe"),
    ];

    candidates.into_iter().find(|candidate| candidate.exists())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_pki::{
        AuditAction, CaStatus, CertificateStatus, NodeStatus, PkiError, RevocationReason,
        ValidationOptions,
    };

    async fn intermediate(pki: &TestPki, parent: &str, id: &str) -> CaConfig {
        let request = CreateCaRequest::new(id, format!("CN={id},O=Sigil Integration"));
        pki.engine
            .create_intermediate_ca(parent, request, 1825, Some(0), ACTOR)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let pki = TestPki::start().await.unwrap();

        // 1. Root and intermediate
        let root = pki.root("root").await.unwrap();
        assert_eq!(root.status, CaStatus::Active);
        let issuing = intermediate(&pki, "root", "issuing").await;
        assert_eq!(issuing.parent_id.as_deref(), Some("root"));
        assert_eq!(issuing.chain_pem.len(), 1);

        // 2. Leaf from the intermediate validates up to the root
        let leaf = pki.issue_server("issuing", "api.example.com").await.unwrap();
        let chain = pki
            .engine
            .validate_chain(
                leaf.certificate_pem.as_bytes(),
                &[],
                &ValidationOptions::default(),
            )
            .await
            .unwrap();
        assert!(chain.is_valid, "issues: {:?}", chain.issues);
        let statuses: Vec<NodeStatus> = chain.nodes.iter().map(|n| n.status).collect();
        assert_eq!(
            statuses,
            vec![NodeStatus::Valid, NodeStatus::Valid, NodeStatus::TrustedRoot]
        );

        // 3. Revoke and publish a full CRL
        let revoked = pki
            .engine
            .revoke(&leaf.serial, RevocationReason::KeyCompromise, ACTOR)
            .await
            .unwrap();
        assert_eq!(revoked.ca_id, "issuing");
        let record = pki.engine.get_certificate(&leaf.serial).await.unwrap();
        assert_eq!(record.status, CertificateStatus::Revoked);

        let full = pki.engine.generate_crl("issuing", ACTOR).await.unwrap();
        assert_eq!(full.number, 1);
        let check = pki
            .engine
            .validate_crl("issuing", &full.crl_der)
            .await
            .unwrap();
        assert!(check.is_valid, "issues: {:?}", check.issues);
        assert_eq!(check.revoked_serials, vec![leaf.serial.clone()]);

        // 4. A later revocation lands on the delta only
        let second = pki.issue_server("issuing", "www.example.com").await.unwrap();
        pki.engine
            .revoke(&second.serial, RevocationReason::Superseded, ACTOR)
            .await
            .unwrap();
        let delta = pki.engine.generate_delta_crl("issuing", ACTOR).await.unwrap();
        assert_eq!(delta.number, 2);
        assert_eq!(delta.delta_of, Some(1));
        assert_eq!(delta.entries, vec![second.serial.clone()]);

        let check = pki
            .engine
            .validate_crl("issuing", &delta.crl_der)
            .await
            .unwrap();
        assert!(check.is_valid, "issues: {:?}", check.issues);
        assert!(check.is_delta);
        assert_eq!(check.base_crl_number, Some(1));

        // 5. Everything left an audit trail
        let actions: Vec<AuditAction> = pki.audit.events().iter().map(|e| e.action).collect();
        for expected in [
            AuditAction::CaCreated,
            AuditAction::CaActivated,
            AuditAction::CertificateIssued,
            AuditAction::CertificateRevoked,
            AuditAction::CrlGenerated,
            AuditAction::DeltaCrlGenerated,
        ] {
            assert!(actions.contains(&expected), "missing {expected}");
        }
        assert!(pki.audit.events().iter().all(|e| e.actor == ACTOR));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let pki = TestPki::start().await.unwrap();
        pki.root("root").await.unwrap();
        let first = pki.issue_server("root", "a.example.com").await.unwrap();
        pki.engine.generate_crl("root", ACTOR).await.unwrap();

        let engine = pki.reopen(&pki.wrapping_key).await.unwrap();

        let cas = engine.list_cas().await.unwrap();
        assert_eq!(cas.len(), 1);
        assert_eq!(cas[0].crl_number, 1);
        assert_eq!(
            engine.get_certificate(&first.serial).await.unwrap().fingerprint,
            first.fingerprint
        );

        // The CA key still decrypts and the CRL sequence continues
        issue_server(&engine, "root", "b.example.com").await.unwrap();
        assert_eq!(engine.generate_crl("root", ACTOR).await.unwrap().number, 2);
        assert_eq!(engine.list_certificates("root").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_wrapping_key_cannot_sign() {
        let pki = TestPki::start().await.unwrap();
        pki.root("root").await.unwrap();

        let engine = pki.reopen(&WrappingKey::generate()).await.unwrap();
        let result = issue_server(&engine, "root", "a.example.com").await;

        let err = result.unwrap_err();
        assert!(
            matches!(err.downcast_ref::<PkiError>(), Some(PkiError::DecryptionFailed(_))),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_wrapping_key_rotation_persists() {
        let pki = TestPki::start().await.unwrap();
        pki.root("root").await.unwrap();
        intermediate(&pki, "root", "issuing").await;

        let profile = CertificateProfile::client(&["device.example.com"]).unwrap();
        let request = IssueRequest {
            store_private_key: true,
            ..IssueRequest::new("issuing", "CN=device", profile)
        };
        let stored = pki.engine.issue(request, ACTOR).await.unwrap();

        let new_key = WrappingKey::generate();
        let report = pki
            .engine
            .rotate_wrapping_key(&new_key, ACTOR)
            .await
            .unwrap();
        assert_eq!(report.cas_rewrapped, 2);
        assert_eq!(report.certificates_rewrapped, 1);
        assert_eq!(report.key_id, new_key.key_id().unwrap());

        // New key works on a fresh engine, the old one no longer does
        let engine = pki.reopen(&new_key).await.unwrap();
        issue_server(&engine, "issuing", "after.example.com")
            .await
            .unwrap();
        let record = engine.get_certificate(&stored.serial).await.unwrap();
        let wrapped = record.wrapped_key.unwrap();
        assert_eq!(wrapped.key_id, new_key.key_id().unwrap());

        let stale = pki.reopen(&pki.wrapping_key).await.unwrap();
        assert!(issue_server(&stale, "issuing", "before.example.com")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_concurrent_issuance_unique_serials() {
        let pki = TestPki::start().await.unwrap();
        pki.root("root").await.unwrap();
        let engine = Arc::new(pki.reopen(&pki.wrapping_key).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..12 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                issue_server(&engine, "root", &format!("host{i}.example.com"))
                    .await
                    .map(|issued| issued.serial)
            }));
        }

        let mut serials = Vec::new();
        for handle in handles {
            serials.push(handle.await.unwrap().unwrap());
        }
        serials.sort();
        serials.dedup();
        assert_eq!(serials.len(), 12);
        assert_eq!(engine.list_certificates("root").await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_suspended_ca_stops_issuing_and_crls() {
        let pki = TestPki::start().await.unwrap();
        pki.root("root").await.unwrap();
        pki.engine.suspend_ca("root", ACTOR).await.unwrap();

        let err = pki.issue_server("root", "a.example.com").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PkiError>(),
            Some(PkiError::CaNotActive { .. })
        ));
        assert!(pki.engine.generate_crl("root", ACTOR).await.is_err());

        pki.engine.reactivate_ca("root", ACTOR).await.unwrap();
        pki.issue_server("root", "a.example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_cli_end_to_end() {
        let Some(cli) = CliRunner::new().unwrap() else {
            eprintln!("sigil binary not built, skipping");
            return;
        };

        cli.run(&["ca", "create", "root", "--subject", "CN=CLI Root,O=Sigil"])
            .unwrap();
        cli.run(&["ca", "self-sign", "root", "--days", "365"]).unwrap();

        let key_path = cli.path("leaf.key");
        let issued = cli
            .run(&[
                "cert",
                "issue",
                "root",
                "--subject",
                "CN=app.example.com",
                "--san",
                "app.example.com",
                "--out-key",
                key_path.to_str().unwrap(),
            ])
            .unwrap();
        assert!(key_path.exists());

        let cert_path = cli.path("leaf.pem");
        std::fs::write(&cert_path, &issued.stdout).unwrap();
        let serial = String::from_utf8_lossy(&issued.stderr)
            .lines()
            .find_map(|line| line.strip_prefix("Serial:").map(|s| s.trim().to_string()))
            .unwrap();

        cli.run(&["chain", "verify", cert_path.to_str().unwrap()])
            .unwrap();

        cli.run(&["cert", "revoke", &serial, "--reason", "key-compromise"])
            .unwrap();
        let crl_path = cli.path("root.crl");
        cli.run(&["crl", "generate", "root", "--out", crl_path.to_str().unwrap()])
            .unwrap();
        let verified = cli
            .run(&["crl", "verify", "root", crl_path.to_str().unwrap()])
            .unwrap();
        assert!(String::from_utf8_lossy(&verified.stdout).contains("VALID"));

        // A second revocation is refused
        let again = cli
            .run_unchecked(&["cert", "revoke", &serial])
            .unwrap();
        assert!(!again.status.success());
    }
}
