//! Clearance vs. reporting decision and the submission pipeline.
use crate::Amount;
use crate::audit::{AuditAction, AuditLogEntry, AuditSink};
use crate::certificate::{
    Certificate, CertificateError, CertificateLeases, CertificateStatus, CertificateStore,
    CertificateType, InvoiceCategory,
};
use crate::chain::{ChainError, ChainKey, InvoiceHashChain, embed_references, hash_invoice};
use crate::gateway::{
    ClearanceResponse, ComplianceCheckResponse, ComplianceGateway, Compliance, CsidCredentials,
    GatewayError, InvoiceSubmission, Production, ReportingResponse, TokenScope,
};
use crate::keys::{KeyError, KeyMaterialService};
use crate::qr::{QrCodeError, QrFields};
use crate::stamp::{CryptographicStamper, Stamp, StampError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedRwLockReadGuard;
use tracing::{info, warn};

const ACTOR: &str = "submission-router";
const LEASE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no signing {certificate_type:?} certificate for {organization_id}/{category}")]
    NoSigningCertificate {
        organization_id: String,
        category: InvoiceCategory,
        certificate_type: CertificateType,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Stamp(#[from] StampError),
    #[error(transparent)]
    Qr(#[from] QrCodeError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// An externally produced invoice ready for stamping and submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub organization_id: String,
    pub category: InvoiceCategory,
    /// Invoice UUID (`cbc:UUID`).
    pub uuid: String,
    pub issued_at: DateTime<Utc>,
    pub seller_name: String,
    pub vat_number: String,
    pub total_with_vat: Amount,
    pub vat_total: Amount,
    /// Unsigned UBL document.
    pub xml: String,
}

impl Invoice {
    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(self.organization_id.clone(), self.category)
    }
}

/// `true` for standard invoices whose tax-inclusive total is strictly above
/// `threshold`.
///
/// # Examples
/// ```rust
/// use fatoora_compliance::Amount;
/// use fatoora_compliance::certificate::InvoiceCategory;
/// use fatoora_compliance::router::requires_clearance;
///
/// let threshold = Amount::from_halalas(1_000_00);
/// assert!(!requires_clearance(InvoiceCategory::Standard, Amount::from_halalas(1_000_00), threshold));
/// assert!(requires_clearance(InvoiceCategory::Standard, Amount::from_halalas(1_000_01), threshold));
/// assert!(!requires_clearance(InvoiceCategory::Simplified, Amount::from_halalas(5_000_00), threshold));
/// ```
pub fn requires_clearance(category: InvoiceCategory, total_with_vat: Amount, threshold: Amount) -> bool {
    category == InvoiceCategory::Standard && total_with_vat > threshold
}

/// What the authority decided for a submitted invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityDecision {
    Cleared(ClearanceResponse),
    Reported(ReportingResponse),
}

impl AuthorityDecision {
    pub fn is_clearance(&self) -> bool {
        matches!(self, AuthorityDecision::Cleared(_))
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub certificate_id: uuid::Uuid,
    pub invoice_hash: String,
    pub previous_invoice_hash: String,
    /// Chain counter after this invoice.
    pub counter: u64,
    pub stamp: Stamp,
    pub qr: String,
    pub signed_xml: String,
    pub decision: AuthorityDecision,
}

/// Result of a compliance-check run; the chain is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplianceCheckOutcome {
    pub certificate_id: uuid::Uuid,
    pub invoice_hash: String,
    pub qr: String,
    pub signed_xml: String,
    pub response: ComplianceCheckResponse,
}

struct Prepared {
    invoice_hash: String,
    stamp: Stamp,
    qr: String,
    signed_xml: String,
}

/// Stamps invoices and sends them to clearance or reporting.
pub struct SubmissionRouter {
    threshold: Amount,
    chain: Arc<InvoiceHashChain>,
    certificates: Arc<dyn CertificateStore>,
    leases: Arc<CertificateLeases>,
    keys: Arc<KeyMaterialService>,
    stamper: Arc<CryptographicStamper>,
    gateway: Arc<ComplianceGateway>,
    audit: Arc<dyn AuditSink>,
}

impl SubmissionRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        threshold: Amount,
        chain: Arc<InvoiceHashChain>,
        certificates: Arc<dyn CertificateStore>,
        leases: Arc<CertificateLeases>,
        keys: Arc<KeyMaterialService>,
        stamper: Arc<CryptographicStamper>,
        gateway: Arc<ComplianceGateway>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            threshold,
            chain,
            certificates,
            leases,
            keys,
            stamper,
            gateway,
            audit,
        }
    }

    pub fn requires_clearance(&self, invoice: &Invoice) -> bool {
        requires_clearance(invoice.category, invoice.total_with_vat, self.threshold)
    }

    /// Stamp `invoice` against its chain head and submit it.
    ///
    /// The chain head advances only when the authority accepts the invoice.
    pub async fn submit(&self, invoice: &Invoice) -> Result<SubmissionOutcome, RouterError> {
        let clearance = self.requires_clearance(invoice);
        let lease = self.chain.lease(invoice.chain_key()).await;
        let previous = lease.head().previous_invoice_hash.clone();

        let (certificate, _cert_lease) = self
            .lease_signing(invoice, CertificateType::Production)
            .await?;
        let action = if clearance {
            AuditAction::InvoiceCleared
        } else {
            AuditAction::InvoiceReported
        };

        let result = async {
            let prepared = self.prepare(invoice, &previous, &certificate)?;
            let creds = credentials::<Production>(&certificate, &self.gateway)?;
            let submission =
                InvoiceSubmission::new(&prepared.invoice_hash, &invoice.uuid, &prepared.signed_xml);
            let decision = if clearance {
                AuthorityDecision::Cleared(self.gateway.clear(&creds, &submission).await?)
            } else {
                AuthorityDecision::Reported(self.gateway.report(&creds, &submission).await?)
            };
            Ok::<_, RouterError>((prepared, decision))
        }
        .await;

        let (prepared, decision) = match result {
            Ok(done) => done,
            Err(e) => {
                warn!(invoice = %invoice.uuid, error = %e, "submission failed; chain head unchanged");
                self.audit.log_action(
                    AuditLogEntry::failure(AuditAction::SubmissionFailed, ACTOR, &e)
                        .with_certificate(certificate.id())
                        .with_detail(invoice.uuid.clone()),
                );
                return Err(e);
            }
        };

        let state = lease.advance(&prepared.invoice_hash)?;
        self.certificates.update(certificate.id(), &mut |cert| {
            cert.record_usage(Utc::now());
            Ok(())
        })?;
        self.audit.log_action(
            AuditLogEntry::success(action, ACTOR)
                .with_certificate(certificate.id())
                .with_detail(invoice.uuid.clone()),
        );
        info!(
            invoice = %invoice.uuid,
            clearance,
            counter = state.counter,
            "invoice accepted by authority"
        );

        Ok(SubmissionOutcome {
            certificate_id: certificate.id(),
            invoice_hash: prepared.invoice_hash,
            previous_invoice_hash: previous,
            counter: state.counter,
            stamp: prepared.stamp,
            qr: prepared.qr,
            signed_xml: prepared.signed_xml,
            decision,
        })
    }

    /// Stamp `invoice` with the compliance certificate and validate it
    /// against the compliance endpoint.
    pub async fn check_compliance(
        &self,
        invoice: &Invoice,
    ) -> Result<ComplianceCheckOutcome, RouterError> {
        let previous = self.chain.head(&invoice.chain_key()).previous_invoice_hash;
        let (certificate, _cert_lease) = self
            .lease_signing(invoice, CertificateType::Compliance)
            .await?;

        let result = async {
            let prepared = self.prepare(invoice, &previous, &certificate)?;
            let creds = credentials::<Compliance>(&certificate, &self.gateway)?;
            let submission =
                InvoiceSubmission::new(&prepared.invoice_hash, &invoice.uuid, &prepared.signed_xml);
            let response = self.gateway.check_compliance(&creds, &submission).await?;
            Ok::<_, RouterError>((prepared, response))
        }
        .await;

        let entry = match &result {
            Ok(_) => AuditLogEntry::success(AuditAction::ComplianceChecked, ACTOR),
            Err(e) => AuditLogEntry::failure(AuditAction::ComplianceChecked, ACTOR, e),
        };
        self.audit.log_action(
            entry
                .with_certificate(certificate.id())
                .with_detail(invoice.uuid.clone()),
        );

        let (prepared, response) = result?;
        Ok(ComplianceCheckOutcome {
            certificate_id: certificate.id(),
            invoice_hash: prepared.invoice_hash,
            qr: prepared.qr,
            signed_xml: prepared.signed_xml,
            response,
        })
    }
}

// Private API
impl SubmissionRouter {
    /// Find the certificate to sign with and hold a read lease on it.
    ///
    /// Submissions need the signing production certificate; compliance
    /// checks use the newest `ACTIVE` compliance certificate, which stops
    /// signing once production is issued. A certificate that changed
    /// while we waited is looked up again.
    async fn lease_signing(
        &self,
        invoice: &Invoice,
        certificate_type: CertificateType,
    ) -> Result<(Certificate, OwnedRwLockReadGuard<()>), RouterError> {
        let usable = |cert: &Certificate| match certificate_type {
            CertificateType::Production => cert.is_signing(),
            CertificateType::Compliance => cert.status() == CertificateStatus::Active,
        };
        for _ in 0..LEASE_ATTEMPTS {
            let candidate = match certificate_type {
                CertificateType::Production => self.certificates.find_signing(
                    &invoice.organization_id,
                    invoice.category,
                    certificate_type,
                ),
                CertificateType::Compliance => self.certificates.find_active(
                    &invoice.organization_id,
                    invoice.category,
                    certificate_type,
                ),
            };
            let Some(candidate) = candidate else {
                break;
            };
            let guard = self.leases.read(candidate.id()).await;
            let current = self.certificates.get(candidate.id())?;
            if usable(&current) {
                return Ok((current, guard));
            }
        }
        Err(RouterError::NoSigningCertificate {
            organization_id: invoice.organization_id.clone(),
            category: invoice.category,
            certificate_type,
        })
    }

    fn prepare(
        &self,
        invoice: &Invoice,
        previous: &str,
        certificate: &Certificate,
    ) -> Result<Prepared, RouterError> {
        let invoice_hash = hash_invoice(&invoice.xml, previous)?;
        let stamp = self.keys.with_private_key(certificate.id(), ACTOR, |key| {
            self.stamper
                .stamp(key, certificate.id(), &invoice.uuid, &invoice_hash)
        })??;
        self.audit.log_action(
            AuditLogEntry::success(AuditAction::InvoiceSigned, ACTOR)
                .with_certificate(certificate.id())
                .with_detail(invoice.uuid.clone()),
        );

        let qr = QrFields {
            seller_name: invoice.seller_name.clone(),
            vat_number: invoice.vat_number.clone(),
            timestamp: invoice.issued_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            total_with_vat: invoice.total_with_vat.to_string(),
            vat_total: invoice.vat_total.to_string(),
            invoice_hash: invoice_hash.clone(),
            signature: stamp.signature.clone(),
            public_key: stamp.public_key.clone(),
            signature_algorithm: stamp.algorithm.clone(),
        }
        .encode()?;
        let signed_xml = embed_references(&invoice.xml, previous, &qr)?;

        Ok(Prepared {
            invoice_hash,
            stamp,
            qr,
            signed_xml,
        })
    }
}

fn credentials<T: TokenScope>(
    certificate: &Certificate,
    gateway: &ComplianceGateway,
) -> Result<CsidCredentials<T>, CertificateError> {
    let token = certificate
        .token()
        .ok_or_else(|| CertificateError::NotUsable {
            id: certificate.id(),
            reason: "no issued token".into(),
        })?;
    Ok(CsidCredentials::from_token(gateway.env(), token))
}

impl std::fmt::Debug for SubmissionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionRouter")
            .field("threshold", &self.threshold)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}
