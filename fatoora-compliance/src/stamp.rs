//! ECDSA stamping of invoice hashes and the signing ledger.
use crate::keys::{public_key_der, public_key_fingerprint};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::pkcs8::DecodePublicKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Algorithm identifier carried in stamps and QR tag 9.
pub const SIGNATURE_ALGORITHM: &str = "ecdsa-secp256k1-sha256";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StampError {
    #[error("invoice hash must be base64 of a 32-byte digest")]
    InvalidHash,
    #[error("malformed stamp: {0}")]
    Malformed(String),
    #[error("unsupported signature algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("signature does not verify")]
    VerificationFailed,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Signature, public key and algorithm for one invoice hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// Base64 DER-encoded ECDSA signature.
    pub signature: String,
    /// Base64 SPKI DER public key.
    pub public_key: String,
    pub algorithm: String,
}

fn digest_bytes(invoice_hash: &str) -> Result<[u8; 32], StampError> {
    let bytes = Base64::decode_vec(invoice_hash.trim()).map_err(|_| StampError::InvalidHash)?;
    bytes.as_slice().try_into().map_err(|_| StampError::InvalidHash)
}

/// Sign the digest bytes behind `invoice_hash` (base64 SHA-256).
pub fn sign_hash(key: &SigningKey, invoice_hash: &str) -> Result<Stamp, StampError> {
    let digest = digest_bytes(invoice_hash)?;
    let signature: Signature = key
        .try_sign(&digest)
        .map_err(|e| StampError::Signing(e.to_string()))?;
    let public_key =
        public_key_der(key.verifying_key()).map_err(|e| StampError::Signing(e.to_string()))?;
    Ok(Stamp {
        signature: Base64::encode_string(signature.to_der().as_bytes()),
        public_key: Base64::encode_string(&public_key),
        algorithm: SIGNATURE_ALGORITHM.to_string(),
    })
}

/// Check `stamp` against `invoice_hash`. Any malformed part is a failure.
///
/// # Examples
/// ```rust
/// use fatoora_compliance::chain::digest_base64;
/// use fatoora_compliance::stamp::{sign_hash, verify_stamp};
/// use k256::ecdsa::SigningKey;
///
/// let key = SigningKey::from_slice(&[7u8; 32])?;
/// let hash = digest_base64(b"<Invoice/>");
/// let stamp = sign_hash(&key, &hash)?;
/// assert!(verify_stamp(&hash, &stamp).is_ok());
/// assert!(verify_stamp(&digest_base64(b"<Invoice></Invoice>"), &stamp).is_err());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn verify_stamp(invoice_hash: &str, stamp: &Stamp) -> Result<(), StampError> {
    if stamp.algorithm != SIGNATURE_ALGORITHM {
        return Err(StampError::UnsupportedAlgorithm(stamp.algorithm.clone()));
    }
    let digest = digest_bytes(invoice_hash)?;
    let key_der = Base64::decode_vec(&stamp.public_key)
        .map_err(|_| StampError::Malformed("public key is not base64".into()))?;
    let key = VerifyingKey::from_public_key_der(&key_der)
        .map_err(|e| StampError::Malformed(format!("public key: {e}")))?;
    let sig_der = Base64::decode_vec(&stamp.signature)
        .map_err(|_| StampError::Malformed("signature is not base64".into()))?;
    let signature = Signature::from_der(&sig_der)
        .map_err(|e| StampError::Malformed(format!("signature: {e}")))?;
    key.verify(&digest, &signature)
        .map_err(|_| StampError::VerificationFailed)
}

/// Immutable record of one stamping attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningOperation {
    pub id: Uuid,
    pub certificate_id: Uuid,
    /// Caller's invoice identifier, usually the invoice UUID.
    pub invoice_reference: String,
    pub invoice_hash: String,
    pub signature: Option<String>,
    pub public_key_fingerprint: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only store of signing operations.
pub trait SigningLedger: Send + Sync {
    fn append(&self, operation: SigningOperation);

    fn for_certificate(&self, certificate_id: Uuid) -> Vec<SigningOperation>;
}

#[derive(Debug, Default)]
pub struct InMemorySigningLedger {
    operations: RwLock<Vec<SigningOperation>>,
}

impl InMemorySigningLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<SigningOperation> {
        self.operations.read().clone()
    }
}

impl SigningLedger for InMemorySigningLedger {
    fn append(&self, operation: SigningOperation) {
        self.operations.write().push(operation);
    }

    fn for_certificate(&self, certificate_id: Uuid) -> Vec<SigningOperation> {
        self.operations
            .read()
            .iter()
            .filter(|op| op.certificate_id == certificate_id)
            .cloned()
            .collect()
    }
}

/// Signs invoice hashes and records every attempt in the ledger.
pub struct CryptographicStamper {
    ledger: Arc<dyn SigningLedger>,
}

impl CryptographicStamper {
    pub fn new(ledger: Arc<dyn SigningLedger>) -> Self {
        Self { ledger }
    }

    pub fn stamp(
        &self,
        key: &SigningKey,
        certificate_id: Uuid,
        invoice_reference: &str,
        invoice_hash: &str,
    ) -> Result<Stamp, StampError> {
        let result = sign_hash(key, invoice_hash);
        let fingerprint = match public_key_fingerprint(key.verifying_key()) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(error = %e, "could not fingerprint signing key");
                None
            }
        };
        let (signature, error) = match &result {
            Ok(stamp) => (Some(stamp.signature.clone()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        self.ledger.append(SigningOperation {
            id: Uuid::new_v4(),
            certificate_id,
            invoice_reference: invoice_reference.to_string(),
            invoice_hash: invoice_hash.to_string(),
            signature,
            public_key_fingerprint: fingerprint,
            success: result.is_ok(),
            error,
            timestamp: Utc::now(),
        });
        debug!(%certificate_id, invoice = invoice_reference, ok = result.is_ok(), "stamped invoice hash");
        result
    }
}

impl std::fmt::Debug for CryptographicStamper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptographicStamper").finish_non_exhaustive()
    }
}
