//! Audit collaborator.
//!
//! The engine hands one [`AuditEvent`] per state-changing operation to an
//! [`AuditSink`]. Delivery is fire-and-forget: a failing sink is logged and
//! never fails the operation that produced the event.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Kind of audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// CA created in INITIALIZING.
    CaCreated,
    /// CA certificate installed.
    CaActivated,
    /// CA suspended.
    CaSuspended,
    /// CA re-validated and reactivated.
    CaReactivated,
    /// Certificate signed.
    CertificateIssued,
    /// Certificate revoked.
    CertificateRevoked,
    /// Full CRL generated.
    CrlGenerated,
    /// Delta CRL generated.
    DeltaCrlGenerated,
    /// Stored keys re-wrapped under a new wrapping key.
    WrappingKeyRotated,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::CaCreated => "ca_created",
            AuditAction::CaActivated => "ca_activated",
            AuditAction::CaSuspended => "ca_suspended",
            AuditAction::CaReactivated => "ca_reactivated",
            AuditAction::CertificateIssued => "certificate_issued",
            AuditAction::CertificateRevoked => "certificate_revoked",
            AuditAction::CrlGenerated => "crl_generated",
            AuditAction::DeltaCrlGenerated => "delta_crl_generated",
            AuditAction::WrappingKeyRotated => "wrapping_key_rotated",
        };
        f.write_str(name)
    }
}

/// One audited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// What happened.
    pub action: AuditAction,
    /// Who did it.
    pub actor: String,
    /// CA concerned, if any.
    pub ca_id: Option<String>,
    /// Subject DN concerned, if any.
    pub subject: Option<String>,
    /// Certificate serial concerned, if any.
    pub serial: Option<String>,
    /// Free-form details.
    pub metadata: BTreeMap<String, String>,
    /// Event time (unix seconds).
    pub at: u64,
}

impl AuditEvent {
    /// Creates an event with no optional fields set.
    pub fn new(action: AuditAction, actor: impl Into<String>, at: u64) -> Self {
        Self {
            action,
            actor: actor.into(),
            ca_id: None,
            subject: None,
            serial: None,
            metadata: BTreeMap::new(),
            at,
        }
    }

    /// Sets the CA id.
    pub fn ca(mut self, ca_id: impl Into<String>) -> Self {
        self.ca_id = Some(ca_id.into());
        self
    }

    /// Sets the subject DN.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the serial.
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Receiver of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Records an event. Errors are reported back only for logging.
    async fn record(&self, event: &AuditEvent) -> Result<(), String>;
}

/// Writes events to the `sigil::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), String> {
        info!(
            target: "sigil::audit",
            action = %event.action,
            actor = %event.actor,
            ca_id = event.ca_id.as_deref().unwrap_or("-"),
            subject = event.subject.as_deref().unwrap_or("-"),
            serial = event.serial.as_deref().unwrap_or("-"),
            metadata = ?event.metadata,
            "Audit event"
        );
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), String> {
        self.events
            .lock()
            .map_err(|e| e.to_string())?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_in_order() {
        let sink = MemoryAuditSink::new();

        let issued = AuditEvent::new(AuditAction::CertificateIssued, "alice", 10)
            .ca("root")
            .serial("0a")
            .with("cert_type", "SERVER");
        let revoked = AuditEvent::new(AuditAction::CertificateRevoked, "bob", 11)
            .ca("root")
            .serial("0a");

        sink.record(&issued).await.unwrap();
        sink.record(&revoked).await.unwrap();

        let events = sink.events();
        assert_eq!(events, vec![issued, revoked]);
        assert_eq!(events[0].metadata.get("cert_type").map(String::as_str), Some("SERVER"));
    }

    #[test]
    fn test_action_names_match_serde() {
        let json = serde_json::to_string(&AuditAction::DeltaCrlGenerated).unwrap();
        assert_eq!(json, format!("\"{}\"", AuditAction::DeltaCrlGenerated));
    }

    #[tokio::test]
    async fn test_tracing_sink_never_fails() {
        let event = AuditEvent::new(AuditAction::CrlGenerated, "system", 0);
        assert!(TracingAuditSink.record(&event).await.is_ok());
    }
}
