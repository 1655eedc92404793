//! Certificate (CSID) records and the storage contract they live behind.
use crate::keys::EncryptedKey;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use uuid::Uuid;

/// Errors raised by certificate state changes and stores.
#[derive(Debug, Error)]
pub enum CertificateError {
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
    #[error("certificate {id} is not usable: {reason}")]
    NotUsable { id: Uuid, reason: String },
    #[error("certificate {0} already exists")]
    Duplicate(Uuid),
}

/// Which authority flow issued the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateType {
    Compliance,
    Production,
}

/// Invoice category a certificate (and a hash chain) is bound to.
///
/// # Examples
/// ```rust
/// use fatoora_compliance::certificate::InvoiceCategory;
///
/// let category: InvoiceCategory = "simplified".parse()?;
/// assert_eq!(category.csr_title(), "0100");
/// # Ok::<(), fatoora_compliance::certificate::CertificateError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceCategory {
    /// Business-to-business tax invoices.
    Standard,
    /// Business-to-consumer invoices.
    Simplified,
}

impl InvoiceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceCategory::Standard => "STANDARD",
            InvoiceCategory::Simplified => "SIMPLIFIED",
        }
    }

    /// Four-flag invoice type written into the CSR `title` attribute.
    pub fn csr_title(&self) -> &'static str {
        match self {
            InvoiceCategory::Standard => "1000",
            InvoiceCategory::Simplified => "0100",
        }
    }

    pub fn is_simplified(&self) -> bool {
        matches!(self, InvoiceCategory::Simplified)
    }
}

impl fmt::Display for InvoiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceCategory {
    type Err = CertificateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STANDARD" | "B2B" => Ok(InvoiceCategory::Standard),
            "SIMPLIFIED" | "B2C" => Ok(InvoiceCategory::Simplified),
            other => Err(CertificateError::NotUsable {
                id: Uuid::nil(),
                reason: format!("unknown invoice category '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateStatus {
    Pending,
    Active,
    Failed,
    Expired,
    Revoked,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Pending => "PENDING",
            CertificateStatus::Active => "ACTIVE",
            CertificateStatus::Failed => "FAILED",
            CertificateStatus::Expired => "EXPIRED",
            CertificateStatus::Revoked => "REVOKED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CertificateStatus::Failed | CertificateStatus::Expired | CertificateStatus::Revoked
        )
    }

    fn can_transition_to(&self, next: CertificateStatus) -> bool {
        use CertificateStatus::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Failed) | (Active, Expired) | (Pending, Revoked)
                | (Active, Revoked)
                | (Expired, Revoked)
        )
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authority-issued token bundle stored on an active certificate.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub request_id: Option<u64>,
    pub binary_security_token: String,
    pub secret: String,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("request_id", &self.request_id)
            .field("binary_security_token", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Persisted certificate record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    id: Uuid,
    organization_id: String,
    certificate_type: CertificateType,
    category: InvoiceCategory,
    status: CertificateStatus,
    encrypted_key: EncryptedKey,
    csr_der: Vec<u8>,
    csr_fingerprint: String,
    token: Option<IssuedToken>,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
    usage_count: u64,
    last_used_at: Option<DateTime<Utc>>,
    is_active: bool,
    predecessor: Option<Uuid>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl Certificate {
    /// New `PENDING` record awaiting token issuance.
    pub fn pending(
        organization_id: impl Into<String>,
        certificate_type: CertificateType,
        category: InvoiceCategory,
        encrypted_key: EncryptedKey,
        csr_der: Vec<u8>,
        csr_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            certificate_type,
            category,
            status: CertificateStatus::Pending,
            encrypted_key,
            csr_der,
            csr_fingerprint: csr_fingerprint.into(),
            token: None,
            valid_from: None,
            valid_to: None,
            usage_count: 0,
            last_used_at: None,
            is_active: false,
            predecessor: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_predecessor(mut self, predecessor: Uuid) -> Self {
        self.predecessor = Some(predecessor);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn certificate_type(&self) -> CertificateType {
        self.certificate_type
    }

    pub fn category(&self) -> InvoiceCategory {
        self.category
    }

    pub fn status(&self) -> CertificateStatus {
        self.status
    }

    pub fn encrypted_key(&self) -> &EncryptedKey {
        &self.encrypted_key
    }

    pub fn csr_der(&self) -> &[u8] {
        &self.csr_der
    }

    pub fn csr_fingerprint(&self) -> &str {
        &self.csr_fingerprint
    }

    pub fn token(&self) -> Option<&IssuedToken> {
        self.token.as_ref()
    }

    pub fn request_id(&self) -> Option<u64> {
        self.token.as_ref().and_then(|t| t.request_id)
    }

    pub fn valid_from(&self) -> Option<DateTime<Utc>> {
        self.valid_from
    }

    pub fn valid_to(&self) -> Option<DateTime<Utc>> {
        self.valid_to
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        self.last_used_at
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn predecessor(&self) -> Option<Uuid> {
        self.predecessor
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `ACTIVE` and flagged as the signing certificate for its key.
    pub fn is_signing(&self) -> bool {
        self.status == CertificateStatus::Active && self.is_active
    }

    /// Whole days until `valid_to`, negative once expired.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.valid_to.map(|to| (to - now).num_days())
    }

    pub fn replace_encrypted_key(&mut self, encrypted_key: EncryptedKey) {
        self.encrypted_key = encrypted_key;
    }

    fn transition(&mut self, next: CertificateStatus) -> Result<(), CertificateError> {
        if !self.status.can_transition_to(next) {
            return Err(CertificateError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.is_active = false;
        }
        Ok(())
    }

    /// `PENDING → ACTIVE` once the authority has issued a token.
    pub fn mark_active(
        &mut self,
        token: IssuedToken,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
    ) -> Result<(), CertificateError> {
        self.transition(CertificateStatus::Active)?;
        self.token = Some(token);
        self.valid_from = Some(valid_from);
        self.valid_to = Some(valid_to);
        Ok(())
    }

    /// `PENDING → FAILED`. Terminal; a retry needs a new certificate.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), CertificateError> {
        self.transition(CertificateStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_expired(&mut self) -> Result<(), CertificateError> {
        self.transition(CertificateStatus::Expired)
    }

    pub fn mark_revoked(&mut self, reason: impl Into<String>) -> Result<(), CertificateError> {
        self.transition(CertificateStatus::Revoked)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn record_usage(&mut self, at: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used_at = Some(at);
    }
}

/// Persistence contract for certificates.
///
/// Implementations must keep at most one signing certificate per
/// (organization, category); [`CertificateStore::promote`] is the only way to
/// hand the flag from one certificate to another.
pub trait CertificateStore: Send + Sync {
    fn insert(&self, certificate: Certificate) -> Result<(), CertificateError>;

    fn get(&self, id: Uuid) -> Result<Certificate, CertificateError>;

    /// Apply `f` to the stored record and persist the result atomically.
    fn update(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Certificate) -> Result<(), CertificateError>,
    ) -> Result<Certificate, CertificateError>;

    fn list(&self) -> Vec<Certificate>;

    /// The signing certificate for (organization, category) if it has the
    /// given type. At most one certificate signs per key.
    fn find_signing(
        &self,
        organization_id: &str,
        category: InvoiceCategory,
        certificate_type: CertificateType,
    ) -> Option<Certificate>;

    /// Most recently created `ACTIVE` certificate of a type, signing or not.
    fn find_active(
        &self,
        organization_id: &str,
        category: InvoiceCategory,
        certificate_type: CertificateType,
    ) -> Option<Certificate>;

    /// Set `is_active` on an `ACTIVE` certificate with no signing sibling.
    fn activate(&self, id: Uuid) -> Result<Certificate, CertificateError>;

    /// Hand the signing flag from `predecessor` to `successor` in one step.
    ///
    /// The predecessor is always cleared. The successor signs when the
    /// predecessor was signing, or when nothing else signs for the key.
    fn promote(&self, successor: Uuid, predecessor: Uuid) -> Result<Certificate, CertificateError>;
}

/// In-process [`CertificateStore`].
#[derive(Debug, Default)]
pub struct InMemoryCertificateStore {
    records: RwLock<HashMap<Uuid, Certificate>>,
}

impl InMemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn signing_sibling<'a>(
    records: &'a HashMap<Uuid, Certificate>,
    cert: &Certificate,
) -> Option<&'a Certificate> {
    records.values().find(|other| {
        other.id != cert.id
            && other.is_signing()
            && other.organization_id == cert.organization_id
            && other.category == cert.category
    })
}

impl CertificateStore for InMemoryCertificateStore {
    fn insert(&self, certificate: Certificate) -> Result<(), CertificateError> {
        let mut records = self.records.write();
        if records.contains_key(&certificate.id) {
            return Err(CertificateError::Duplicate(certificate.id));
        }
        records.insert(certificate.id, certificate);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Certificate, CertificateError> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(CertificateError::NotFound(id))
    }

    fn update(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Certificate) -> Result<(), CertificateError>,
    ) -> Result<Certificate, CertificateError> {
        let mut records = self.records.write();
        let stored = records.get_mut(&id).ok_or(CertificateError::NotFound(id))?;
        let mut draft = stored.clone();
        f(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    fn list(&self) -> Vec<Certificate> {
        self.records.read().values().cloned().collect()
    }

    fn find_signing(
        &self,
        organization_id: &str,
        category: InvoiceCategory,
        certificate_type: CertificateType,
    ) -> Option<Certificate> {
        self.records
            .read()
            .values()
            .find(|cert| {
                cert.is_signing()
                    && cert.organization_id == organization_id
                    && cert.category == category
                    && cert.certificate_type == certificate_type
            })
            .cloned()
    }

    fn find_active(
        &self,
        organization_id: &str,
        category: InvoiceCategory,
        certificate_type: CertificateType,
    ) -> Option<Certificate> {
        self.records
            .read()
            .values()
            .filter(|cert| {
                cert.status == CertificateStatus::Active
                    && cert.organization_id == organization_id
                    && cert.category == category
                    && cert.certificate_type == certificate_type
            })
            .max_by_key(|cert| (cert.is_active, cert.created_at))
            .cloned()
    }

    fn activate(&self, id: Uuid) -> Result<Certificate, CertificateError> {
        let mut records = self.records.write();
        let cert = records.get(&id).ok_or(CertificateError::NotFound(id))?;
        if cert.status != CertificateStatus::Active {
            return Err(CertificateError::NotUsable {
                id,
                reason: format!("status is {}", cert.status),
            });
        }
        if let Some(existing) = signing_sibling(&records, cert) {
            return Err(CertificateError::ActiveConflict {
                organization_id: cert.organization_id.clone(),
                category: cert.category,
                existing: existing.id,
            });
        }
        let cert = records.get_mut(&id).ok_or(CertificateError::NotFound(id))?;
        cert.is_active = true;
        Ok(cert.clone())
    }

    fn promote(&self, successor: Uuid, predecessor: Uuid) -> Result<Certificate, CertificateError> {
        let mut records = self.records.write();
        let prev = records
            .get(&predecessor)
            .ok_or(CertificateError::NotFound(predecessor))?;
        let next = records
            .get(&successor)
            .ok_or(CertificateError::NotFound(successor))?;
        if next.status != CertificateStatus::Active {
            return Err(CertificateError::NotUsable {
                id: successor,
                reason: format!("successor status is {}", next.status),
            });
        }
        if prev.organization_id != next.organization_id || prev.category != next.category {
            return Err(CertificateError::NotUsable {
                id: successor,
                reason: format!(
                    "successor is for {}/{}, predecessor for {}/{}",
                    next.organization_id, next.category, prev.organization_id, prev.category
                ),
            });
        }
        let signs = prev.is_signing() || signing_sibling(&records, next).is_none();

        if let Some(prev) = records.get_mut(&predecessor) {
            prev.is_active = false;
        }
        let next = records
            .get_mut(&successor)
            .ok_or(CertificateError::NotFound(successor))?;
        next.is_active = signs;
        Ok(next.clone())
    }
}

/// Per-certificate leases.
///
/// Signing holds a read lease for as long as it uses a certificate's key;
/// promotion during rotation takes the write lease, so it waits for every
/// in-flight signature over the predecessor.
#[derive(Debug, Default)]
pub struct CertificateLeases {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::RwLock<()>>>>,
}

impl CertificateLeases {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::RwLock<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    pub async fn read(&self, id: Uuid) -> OwnedRwLockReadGuard<()> {
        self.lock_for(id).read_owned().await
    }

    pub async fn write(&self, id: Uuid) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(id).write_owned().await
    }
}
