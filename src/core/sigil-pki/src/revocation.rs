//! Certificate revocation.

use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent};
use crate::engine::{normalize_serial, PkiEngine};
use crate::error::{PkiError, Result};
use crate::types::{CertificateStatus, RevocationReason, RevocationRecord};

impl PkiEngine {
    /// Revokes the certificate with `serial`.
    ///
    /// Revocation is not idempotent: a second call fails with
    /// [`PkiError::AlreadyRevoked`] and leaves the first record untouched.
    /// This is the only path that creates revocation records.
    pub async fn revoke(
        &self,
        serial: &str,
        reason: RevocationReason,
        actor: &str,
    ) -> Result<RevocationRecord> {
        let serial = normalize_serial(serial);
        let ca_id = self
            .store
            .serial_owner(&serial)
            .await?
            .ok_or_else(|| PkiError::CertificateNotFound(serial.clone()))?;

        let lock = self.ca_lock(&ca_id);
        let _guard = lock.lock().await;

        let mut certificate = self
            .store
            .get_certificate(&ca_id, &serial)
            .await?
            .ok_or_else(|| PkiError::CertificateNotFound(serial.clone()))?;

        if certificate.status == CertificateStatus::Revoked {
            return Err(PkiError::AlreadyRevoked(serial));
        }
        if !certificate
            .status
            .can_transition_to(CertificateStatus::Revoked)
        {
            return Err(PkiError::InvalidTransition {
                entity: serial,
                from: certificate.status.to_string(),
                to: CertificateStatus::Revoked.to_string(),
            });
        }

        let now = Self::now();
        let record = RevocationRecord {
            serial: serial.clone(),
            ca_id: ca_id.clone(),
            revoked_at: now,
            reason,
            revoked_by: actor.to_string(),
        };

        // The create-only insert decides; the status update follows it.
        let inserted = self.store.insert_revocation(&record).await?;
        certificate.status = CertificateStatus::Revoked;
        self.store.put_certificate(&certificate).await?;

        if !inserted {
            warn!(ca_id = %ca_id, serial = %serial, "Revocation record already present, status repaired");
            return Err(PkiError::AlreadyRevoked(serial));
        }

        info!(
            ca_id = %ca_id,
            serial = %serial,
            reason = %reason,
            on_crl = reason.appears_on_crl(),
            "Certificate revoked"
        );
        self.emit(
            AuditEvent::new(AuditAction::CertificateRevoked, actor, now)
                .ca(&ca_id)
                .subject(&certificate.subject)
                .serial(&serial)
                .with("reason", reason),
        )
        .await;

        Ok(record)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::authority::CreateCaRequest;
    use crate::test_support::{issue_server, root_ca, setup, ACTOR};

    #[tokio::test]
    async fn test_revoke_marks_certificate_and_records_once() {
        let (engine, audit) = setup();
        root_ca(&engine, "root", None).await;
        let issued = issue_server(&engine, "root", "www.example.com").await;

        let record = engine
            .revoke(&issued.serial, RevocationReason::KeyCompromise, ACTOR)
            .await
            .unwrap();
        assert_eq!(record.serial, issued.serial);
        assert_eq!(record.ca_id, "root");
        assert_eq!(record.revoked_by, ACTOR);

        let second = engine
            .revoke(&issued.serial, RevocationReason::Superseded, ACTOR)
            .await;
        assert!(matches!(second, Err(PkiError::AlreadyRevoked(_))));

        let revocations = engine.list_revocations("root").await.unwrap();
        assert_eq!(revocations, vec![record]);
        assert_eq!(
            engine.get_certificate(&issued.serial).await.unwrap().status,
            CertificateStatus::Revoked
        );

        let revoked_events = audit
            .events()
            .iter()
            .filter(|e| e.action == AuditAction::CertificateRevoked)
            .count();
        assert_eq!(revoked_events, 1);
    }

    #[tokio::test]
    async fn test_concurrent_revocations_have_one_winner() {
        let (engine, _audit) = setup();
        root_ca(&engine, "root", None).await;
        let issued = issue_server(&engine, "root", "www.example.com").await;

        let (a, b) = tokio::join!(
            engine.revoke(&issued.serial, RevocationReason::KeyCompromise, ACTOR),
            engine.revoke(&issued.serial, RevocationReason::CessationOfOperation, ACTOR),
        );

        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(engine.list_revocations("root").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_serial_spelling_is_normalized() {
        let (engine, _audit) = setup();
        root_ca(&engine, "root", None).await;
        let issued = issue_server(&engine, "root", "www.example.com").await;

        let spelled = issued
            .serial
            .to_uppercase()
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":");
        let record = engine
            .revoke(&spelled, RevocationReason::Superseded, ACTOR)
            .await
            .unwrap();
        assert_eq!(record.serial, issued.serial);
    }

    #[tokio::test]
    async fn test_unknown_serial_is_not_found() {
        let (engine, _audit) = setup();
        root_ca(&engine, "root", None).await;

        let result = engine
            .revoke("0badc0de", RevocationReason::KeyCompromise, ACTOR)
            .await;
        assert!(matches!(result, Err(PkiError::CertificateNotFound(_))));
    }

    #[tokio::test]
    async fn test_parent_can_revoke_intermediate() {
        let (engine, _audit) = setup();
        root_ca(&engine, "root", None).await;
        engine
            .create_intermediate_ca(
                "root",
                CreateCaRequest::new("issuing", "CN=Issuing CA"),
                1825,
                Some(0),
                ACTOR,
            )
            .await
            .unwrap();

        let intermediate = engine
            .list_certificates("root")
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.subject == "CN=Issuing CA")
            .unwrap();
        engine
            .revoke(&intermediate.serial, RevocationReason::CaCompromise, ACTOR)
            .await
            .unwrap();

        assert_eq!(engine.list_revocations("root").await.unwrap().len(), 1);
        assert!(engine.list_revocations("issuing").await.unwrap().is_empty());
    }
}
