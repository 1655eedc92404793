//! Certificate onboarding, issuance, renewal sweep, rotation and revocation.
use crate::audit::{AuditAction, AuditLogEntry, AuditSink};
use crate::certificate::{
    Certificate, CertificateError, CertificateLeases, CertificateStatus, CertificateStore,
    CertificateType, InvoiceCategory,
};
use crate::config::{MAX_VALIDITY_DAYS, RotationSettings};
use crate::csr::{CsrBundle, CsrConfig, CsrError};
use crate::gateway::{
    Compliance, ComplianceGateway, CsidCredentials, CsidResponse, GatewayError, Production,
};
use crate::keys::{KeyError, KeyMaterialService};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use x509_cert::der::Decode;

const ACTOR: &str = "certificate-lifecycle";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("certificate {0} not found")]
    NotFound(Uuid),

    #[error("certificate {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: CertificateStatus,
        to: CertificateStatus,
    },

    #[error("certificate {existing} is already active for {organization_id}/{category}")]
    ActiveConflict {
        organization_id: String,
        category: InvoiceCategory,
        existing: Uuid,
    },

    #[error("certificate {id} is not eligible: {reason}")]
    NotEligible { id: Uuid, reason: String },

    #[error(transparent)]
    Certificate(CertificateError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Csr(#[from] CsrError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<CertificateError> for LifecycleError {
    fn from(error: CertificateError) -> Self {
        match error {
            CertificateError::NotFound(id) => LifecycleError::NotFound(id),
            CertificateError::InvalidTransition { id, from, to } => {
                LifecycleError::InvalidTransition { id, from, to }
            }
            CertificateError::ActiveConflict {
                organization_id,
                category,
                existing,
            } => LifecycleError::ActiveConflict {
                organization_id,
                category,
                existing,
            },
            other => LifecycleError::Certificate(other),
        }
    }
}

/// Raised by the sweep for an active certificate close to expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalSignal {
    pub certificate_id: Uuid,
    pub organization_id: String,
    pub category: InvoiceCategory,
    pub certificate_type: CertificateType,
    pub valid_to: DateTime<Utc>,
    pub days_until_expiry: i64,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub expired: Vec<Uuid>,
    pub renewals_due: Vec<RenewalSignal>,
    pub failed: Vec<(Uuid, String)>,
}

/// Validity window carried by an issued token, if it decodes as an X.509
/// certificate. The token is base64 of either the DER or of its base64 text.
pub fn token_validity(binary_security_token: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let outer = Base64::decode_vec(binary_security_token.trim()).ok()?;
    let der = match outer.first() {
        Some(0x30) => outer,
        _ => {
            let text = std::str::from_utf8(&outer).ok()?;
            Base64::decode_vec(text.trim()).ok()?
        }
    };
    let certificate = x509_cert::Certificate::from_der(&der).ok()?;
    let validity = certificate.tbs_certificate.validity;
    let to_utc = |time: x509_cert::time::Time| {
        let since_epoch = time.to_unix_duration();
        DateTime::from_timestamp(since_epoch.as_secs() as i64, since_epoch.subsec_nanos())
    };
    Some((to_utc(validity.not_before)?, to_utc(validity.not_after)?))
}

/// Drives certificates from request to retirement.
pub struct CertificateLifecycleManager {
    settings: RotationSettings,
    keys: Arc<KeyMaterialService>,
    certificates: Arc<dyn CertificateStore>,
    leases: Arc<CertificateLeases>,
    gateway: Arc<ComplianceGateway>,
    audit: Arc<dyn AuditSink>,
    renewals: Option<mpsc::Sender<RenewalSignal>>,
}

impl CertificateLifecycleManager {
    pub fn new(
        settings: RotationSettings,
        keys: Arc<KeyMaterialService>,
        certificates: Arc<dyn CertificateStore>,
        leases: Arc<CertificateLeases>,
        gateway: Arc<ComplianceGateway>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            settings,
            keys,
            certificates,
            leases,
            gateway,
            audit,
            renewals: None,
        }
    }

    /// Deliver renewal signals from [`sweep`](Self::sweep) to `sender`.
    pub fn with_renewal_channel(mut self, sender: mpsc::Sender<RenewalSignal>) -> Self {
        self.renewals = Some(sender);
        self
    }

    /// Generate a key and CSR for `identity` and onboard it for a compliance CSID.
    pub async fn onboard_compliance(
        &self,
        organization_id: &str,
        identity: &CsrConfig,
        category: InvoiceCategory,
        otp: &str,
    ) -> Result<Certificate, LifecycleError> {
        let (pending, bundle) = self.create_pending(
            organization_id,
            identity,
            category,
            CertificateType::Compliance,
            None,
        )?;
        let result = self.gateway.onboard_compliance(&bundle, otp).await;
        let certificate = self.settle(pending.id(), result, AuditAction::ComplianceOnboarded)?;
        self.activate_if_free(certificate)
    }

    /// Exchange an active compliance certificate for a production one.
    ///
    /// The production certificate reuses the compliance key and CSR. It
    /// becomes the signing certificate unless another production
    /// certificate already signs for the key; the compliance certificate
    /// stops signing either way.
    pub async fn request_production(
        &self,
        compliance_id: Uuid,
        otp: Option<&str>,
    ) -> Result<Certificate, LifecycleError> {
        let compliance = self.certificates.get(compliance_id)?;
        if compliance.certificate_type() != CertificateType::Compliance
            || compliance.status() != CertificateStatus::Active
        {
            return Err(LifecycleError::NotEligible {
                id: compliance_id,
                reason: format!(
                    "expected an active compliance certificate, found {:?}/{}",
                    compliance.certificate_type(),
                    compliance.status()
                ),
            });
        }
        let token = match compliance.token() {
            Some(token) if token.request_id.is_some() => token,
            _ => {
                return Err(LifecycleError::NotEligible {
                    id: compliance_id,
                    reason: "compliance certificate has no request id".into(),
                });
            }
        };
        let ccsid = CsidCredentials::<Compliance>::from_token(self.gateway.env(), token);

        let pending = Certificate::pending(
            compliance.organization_id(),
            CertificateType::Production,
            compliance.category(),
            compliance.encrypted_key().clone(),
            compliance.csr_der().to_vec(),
            compliance.csr_fingerprint(),
        );
        let pending_id = pending.id();
        self.certificates.insert(pending)?;

        let result = self.gateway.request_production(&ccsid, otp).await;
        self.settle(pending_id, result, AuditAction::ProductionIssued)?;

        // Takes over the signing slot from the compliance certificate.
        let production = self.certificates.promote(pending_id, compliance_id)?;
        if production.is_signing() {
            self.audit.log_action(
                AuditLogEntry::success(AuditAction::CertificateActivated, ACTOR)
                    .with_certificate(pending_id)
                    .with_detail(format!("replaces {compliance_id}")),
            );
        } else {
            debug!(certificate = %pending_id, "left inactive; another certificate is signing");
        }
        Ok(production)
    }

    /// Make an `ACTIVE` certificate the signing certificate for its key.
    pub fn activate(&self, id: Uuid, actor: &str) -> Result<Certificate, LifecycleError> {
        let result = self.certificates.activate(id);
        let entry = match &result {
            Ok(_) => AuditLogEntry::success(AuditAction::CertificateActivated, actor),
            Err(e) => AuditLogEntry::failure(AuditAction::CertificateActivated, actor, e),
        };
        self.audit.log_action(entry.with_certificate(id));
        Ok(result?)
    }

    /// Expire certificates past `valid_to` and signal those nearing it.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for certificate in self.certificates.list() {
            if certificate.status() != CertificateStatus::Active {
                continue;
            }
            report.checked += 1;
            let Some(valid_to) = certificate.valid_to() else {
                debug!(certificate = %certificate.id(), "no validity window; skipped");
                continue;
            };

            if now > valid_to {
                match self
                    .certificates
                    .update(certificate.id(), &mut |cert| cert.mark_expired())
                {
                    Ok(_) => {
                        info!(certificate = %certificate.id(), "certificate expired");
                        self.audit.log_action(
                            AuditLogEntry::success(AuditAction::CertificateExpired, ACTOR)
                                .with_certificate(certificate.id()),
                        );
                        report.expired.push(certificate.id());
                    }
                    Err(e) => {
                        warn!(certificate = %certificate.id(), error = %e, "could not expire certificate");
                        report.failed.push((certificate.id(), e.to_string()));
                    }
                }
                continue;
            }

            let days = (valid_to - now).num_days();
            if certificate.is_active() && days <= self.settings.warning_window_days {
                let signal = RenewalSignal {
                    certificate_id: certificate.id(),
                    organization_id: certificate.organization_id().to_string(),
                    category: certificate.category(),
                    certificate_type: certificate.certificate_type(),
                    valid_to,
                    days_until_expiry: days,
                };
                self.audit.log_action(
                    AuditLogEntry::success(AuditAction::RenewalDue, ACTOR)
                        .with_certificate(certificate.id())
                        .with_detail(format!("{days} days left")),
                );
                self.emit(signal.clone());
                report.renewals_due.push(signal);
            }
        }
        debug!(
            checked = report.checked,
            expired = report.expired.len(),
            renewals = report.renewals_due.len(),
            "certificate sweep finished"
        );
        report
    }

    /// Replace certificate `id` with a freshly keyed successor.
    ///
    /// The predecessor stays the signing certificate until the successor is
    /// `ACTIVE`; the hand-over waits for signatures in flight on it. A
    /// predecessor that was not signing hands nothing over.
    pub async fn rotate(
        &self,
        id: Uuid,
        identity: &CsrConfig,
        otp: &str,
    ) -> Result<Certificate, LifecycleError> {
        let predecessor = self.certificates.get(id)?;
        if predecessor.status() != CertificateStatus::Active {
            return Err(LifecycleError::NotEligible {
                id,
                reason: format!("cannot rotate a {} certificate", predecessor.status()),
            });
        }

        let (pending, bundle) = self.create_pending(
            predecessor.organization_id(),
            identity,
            predecessor.category(),
            predecessor.certificate_type(),
            Some(id),
        )?;

        let result = match predecessor.certificate_type() {
            CertificateType::Production => {
                let token = predecessor.token().ok_or_else(|| LifecycleError::NotEligible {
                    id,
                    reason: "no issued token to renew with".into(),
                })?;
                let pcsid = CsidCredentials::<Production>::from_token(self.gateway.env(), token);
                self.gateway.renew_production(&pcsid, &bundle, otp).await
            }
            CertificateType::Compliance => self.gateway.onboard_compliance(&bundle, otp).await,
        };
        let successor = self.settle(pending.id(), result, AuditAction::CertificateRotated)?;

        let _write = self.leases.write(id).await;
        let successor = self.certificates.promote(successor.id(), id)?;
        if successor.is_signing() {
            self.audit.log_action(
                AuditLogEntry::success(AuditAction::CertificateActivated, ACTOR)
                    .with_certificate(successor.id())
                    .with_detail(format!("replaces {id}")),
            );
        }
        info!(
            predecessor = %id,
            successor = %successor.id(),
            signing = successor.is_signing(),
            "certificate rotated"
        );
        Ok(successor)
    }

    /// Revoke `id`. Irreversible.
    pub fn revoke(&self, id: Uuid, actor: &str, reason: &str) -> Result<Certificate, LifecycleError> {
        let result = self
            .certificates
            .update(id, &mut |cert| cert.mark_revoked(reason));
        let entry = match &result {
            Ok(_) => AuditLogEntry::success(AuditAction::CertificateRevoked, actor)
                .with_detail(reason.to_string()),
            Err(e) => AuditLogEntry::failure(AuditAction::CertificateRevoked, actor, e),
        };
        self.audit.log_action(entry.with_certificate(id));
        if result.is_ok() {
            warn!(certificate = %id, actor, reason, "certificate revoked");
        }
        Ok(result?)
    }
}

// Private API
impl CertificateLifecycleManager {
    fn create_pending(
        &self,
        organization_id: &str,
        identity: &CsrConfig,
        category: InvoiceCategory,
        certificate_type: CertificateType,
        predecessor: Option<Uuid>,
    ) -> Result<(Certificate, CsrBundle), LifecycleError> {
        let pair = self.keys.generate_key_pair(ACTOR)?;
        let signing_key = pair.signing_key()?;
        let bundle = match identity
            .for_category(category)
            .build(&signing_key, self.gateway.env())
        {
            Ok(bundle) => bundle,
            Err(e) => {
                self.audit
                    .log_action(AuditLogEntry::failure(AuditAction::CsrBuilt, ACTOR, &e));
                return Err(e.into());
            }
        };
        let encrypted = self.keys.encrypt_key_pair(&pair)?;

        let mut pending = Certificate::pending(
            organization_id,
            certificate_type,
            category,
            encrypted,
            bundle.der().to_vec(),
            bundle.fingerprint(),
        );
        if let Some(predecessor) = predecessor {
            pending = pending.with_predecessor(predecessor);
        }
        self.audit.log_action(
            AuditLogEntry::success(AuditAction::CsrBuilt, ACTOR)
                .with_certificate(pending.id())
                .with_detail(bundle.fingerprint().to_string()),
        );
        self.certificates.insert(pending.clone())?;
        Ok((pending, bundle))
    }

    /// Record the authority's answer on a pending certificate.
    fn settle(
        &self,
        id: Uuid,
        result: Result<CsidResponse, GatewayError>,
        action: AuditAction,
    ) -> Result<Certificate, LifecycleError> {
        match result {
            Ok(response) => {
                let now = Utc::now();
                let (valid_from, valid_to) = token_validity(response.binary_security_token())
                    .or_else(|| response.token_expiry().map(|to| (now, to)))
                    .unwrap_or_else(|| {
                        let days = self
                            .settings
                            .default_validity_days
                            .clamp(1, MAX_VALIDITY_DAYS);
                        (now, now + Duration::days(days))
                    });
                let token = response.issued_token();
                let certificate = self.certificates.update(id, &mut |cert| {
                    cert.mark_active(token.clone(), valid_from, valid_to)
                })?;
                self.audit.log_action(
                    AuditLogEntry::success(action, ACTOR)
                        .with_certificate(id)
                        .with_detail(response.disposition_message().unwrap_or("ISSUED").to_string()),
                );
                info!(certificate = %id, %valid_to, "certificate issued");
                Ok(certificate)
            }
            Err(error) => {
                let reason = error.to_string();
                if let Err(e) = self
                    .certificates
                    .update(id, &mut |cert| cert.mark_failed(reason.clone()))
                {
                    warn!(certificate = %id, error = %e, "could not mark certificate failed");
                }
                self.audit.log_action(
                    AuditLogEntry::failure(action, ACTOR, &error).with_certificate(id),
                );
                warn!(certificate = %id, error = %error, "certificate issuance failed");
                Err(error.into())
            }
        }
    }

    /// Flag a freshly issued certificate as signing unless another holds it.
    fn activate_if_free(&self, certificate: Certificate) -> Result<Certificate, LifecycleError> {
        match self.certificates.activate(certificate.id()) {
            Ok(active) => {
                self.audit.log_action(
                    AuditLogEntry::success(AuditAction::CertificateActivated, ACTOR)
                        .with_certificate(active.id()),
                );
                Ok(active)
            }
            Err(CertificateError::ActiveConflict { existing, .. }) => {
                debug!(certificate = %certificate.id(), %existing, "left inactive; another certificate is signing");
                Ok(certificate)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn emit(&self, signal: RenewalSignal) {
        let Some(sender) = &self.renewals else {
            return;
        };
        if let Err(e) = sender.try_send(signal) {
            warn!(error = %e, "renewal signal dropped");
        }
    }
}

impl std::fmt::Debug for CertificateLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateLifecycleManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
