//! Append-only, best-effort audit trail.
//!
//! [`AuditSink::log_action`] has no error channel: a sink that cannot persist
//! an entry logs the failure locally and carries on, so auditing never fails
//! the operation being audited.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Operation recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    KeyGenerated,
    PrivateKeyAccessed,
    KeyReencrypted,
    CsrBuilt,
    ComplianceOnboarded,
    ProductionIssued,
    CertificateActivated,
    CertificateRotated,
    CertificateRevoked,
    CertificateExpired,
    RenewalDue,
    InvoiceSigned,
    InvoiceCleared,
    InvoiceReported,
    ComplianceChecked,
    SubmissionFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::KeyGenerated => "key_generated",
            AuditAction::PrivateKeyAccessed => "private_key_accessed",
            AuditAction::KeyReencrypted => "key_reencrypted",
            AuditAction::CsrBuilt => "csr_built",
            AuditAction::ComplianceOnboarded => "compliance_onboarded",
            AuditAction::ProductionIssued => "production_issued",
            AuditAction::CertificateActivated => "certificate_activated",
            AuditAction::CertificateRotated => "certificate_rotated",
            AuditAction::CertificateRevoked => "certificate_revoked",
            AuditAction::CertificateExpired => "certificate_expired",
            AuditAction::RenewalDue => "renewal_due",
            AuditAction::InvoiceSigned => "invoice_signed",
            AuditAction::InvoiceCleared => "invoice_cleared",
            AuditAction::InvoiceReported => "invoice_reported",
            AuditAction::ComplianceChecked => "compliance_checked",
            AuditAction::SubmissionFailed => "submission_failed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single audit record. Never mutated after construction by a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub action: AuditAction,
    pub actor: String,
    pub success: bool,
    pub error: Option<String>,
    pub certificate_id: Option<Uuid>,
    /// Free-form correlation detail such as a CSR fingerprint or invoice uuid.
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn success(action: AuditAction, actor: impl Into<String>) -> Self {
        Self {
            action,
            actor: actor.into(),
            success: true,
            error: None,
            certificate_id: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(action: AuditAction, actor: impl Into<String>, error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::success(action, actor)
        }
    }

    pub fn with_certificate(mut self, certificate_id: Uuid) -> Self {
        self.certificate_id = Some(certificate_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Audit logging contract.
pub trait AuditSink: Send + Sync {
    fn log_action(&self, entry: AuditLogEntry);
}

/// Errors a fallible [`AuditWriter`] may report. They never leave the sink.
#[derive(Debug, Error)]
pub enum AuditWriteError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit writer unavailable: {0}")]
    Unavailable(String),
}

/// Durable destination for audit entries.
pub trait AuditWriter: Send + 'static {
    fn write(&mut self, entry: &AuditLogEntry) -> Result<(), AuditWriteError>;
}

/// Writes one JSON document per line.
pub struct JsonLinesWriter<W: Write + Send + 'static> {
    out: W,
}

impl<W: Write + Send + 'static> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send + 'static> AuditWriter for JsonLinesWriter<W> {
    fn write(&mut self, entry: &AuditLogEntry) -> Result<(), AuditWriteError> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Emits every entry as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_action(&self, entry: AuditLogEntry) {
        if entry.success {
            info!(
                target: "fatoora::audit",
                action = %entry.action,
                actor = %entry.actor,
                certificate_id = ?entry.certificate_id,
                detail = ?entry.detail,
                "audit"
            );
        } else {
            warn!(
                target: "fatoora::audit",
                action = %entry.action,
                actor = %entry.actor,
                certificate_id = ?entry.certificate_id,
                detail = ?entry.detail,
                error = ?entry.error,
                "audit"
            );
        }
    }
}

/// Keeps entries in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().clone()
    }

    pub fn entries_for(&self, action: AuditAction) -> Vec<AuditLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_action(&self, entry: AuditLogEntry) {
        self.entries.lock().push(entry);
    }
}

/// Synchronous sink over a fallible writer; write errors are logged and dropped.
pub struct BestEffortSink<W: AuditWriter> {
    writer: Mutex<W>,
}

impl<W: AuditWriter> BestEffortSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: AuditWriter> AuditSink for BestEffortSink<W> {
    fn log_action(&self, entry: AuditLogEntry) {
        if let Err(e) = self.writer.lock().write(&entry) {
            warn!(action = %entry.action, error = %e, "dropping audit entry");
        }
    }
}

/// Fire-and-forget sink: entries are queued to a writer task.
///
/// The task ends once every `ChannelAuditSink` clone has been dropped and the
/// queue has drained.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditLogEntry>,
}

impl ChannelAuditSink {
    pub fn spawn<W: AuditWriter>(mut writer: W) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditLogEntry>();
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = writer.write(&entry) {
                    warn!(action = %entry.action, error = %e, "dropping audit entry");
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl AuditSink for ChannelAuditSink {
    fn log_action(&self, entry: AuditLogEntry) {
        if let Err(e) = self.tx.send(entry) {
            warn!(action = %e.0.action, "audit writer task has stopped");
        }
    }
}
