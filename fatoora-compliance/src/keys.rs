//! Key generation and at-rest encryption of certificate private keys.
use crate::audit::{AuditAction, AuditLogEntry, AuditSink};
use crate::certificate::{CertificateError, CertificateStore};
use crate::config::MASTER_KEY_ENV;
use aes_gcm::{
    Aes256Gcm, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HKDF_SALT: &[u8] = b"fatoora-compliance/private-key-encryption/v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum KeyError {
    /// Authentication tag did not verify, or the IV/tag were malformed.
    #[error("integrity check failed for key '{key_id}'")]
    Integrity { key_id: String },

    #[error("invalid master key: {message}")]
    MasterKey { message: String },

    #[error("key encoding error: {message}")]
    Encoding { message: String },

    #[error("encryption failed: {message}")]
    Encryption { message: String },

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// 32-byte master secret from which per-`key_id` encryption keys derive.
pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(Base64::decode_vec(encoded.trim()).map_err(|e| {
            KeyError::MasterKey {
                message: format!("not base64: {e}"),
            }
        })?);
        let bytes: [u8; 32] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| KeyError::MasterKey {
                    message: format!("expected 32 bytes, got {}", decoded.len()),
                })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Read the master secret from `FATOORA_MASTER_KEY`.
    pub fn from_env() -> Result<Self, KeyError> {
        let value = Zeroizing::new(std::env::var(MASTER_KEY_ENV).map_err(|_| {
            KeyError::MasterKey {
                message: format!("{MASTER_KEY_ENV} is not set"),
            }
        })?);
        Self::from_base64(&value)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let key = Self::from_bytes(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        key
    }

    /// HKDF-SHA256 with a fixed salt and `key_id` as info.
    fn derive(&self, key_id: &str) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let prk = hkdf_extract(HKDF_SALT, self.0.as_slice())?;
        hkdf_expand_32(&prk, key_id.as_bytes())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| KeyError::MasterKey {
        message: e.to_string(),
    })?;
    for part in parts {
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    hmac_sha256(salt, &[ikm])
}

// Single-block expand: T(1) = HMAC(PRK, info || 0x01).
fn hkdf_expand_32(prk: &[u8; 32], info: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    hmac_sha256(prk, &[info, &[1u8]])
}

/// Private key encrypted at rest with AES-256-GCM.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub key_id: String,
}

impl fmt::Debug for EncryptedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedKey")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Freshly generated secp256k1 key pair in PEM form. Never persisted as-is.
pub struct KeyPair {
    private_pem: Zeroizing<String>,
    public_pem: String,
    public_key_der: Vec<u8>,
}

impl KeyPair {
    pub fn generate() -> Result<Self, KeyError> {
        Self::from_signing_key(&SigningKey::random(&mut OsRng))
    }

    pub fn from_signing_key(key: &SigningKey) -> Result<Self, KeyError> {
        let private_pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encoding {
                message: e.to_string(),
            })?;
        let verifying = key.verifying_key();
        let public_pem = verifying
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encoding {
                message: e.to_string(),
            })?;
        let public_key_der = public_key_der(verifying)?;
        Ok(Self {
            private_pem,
            public_pem,
            public_key_der,
        })
    }

    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Base64 SPKI DER, the form carried in stamps and QR codes.
    pub fn public_key_base64(&self) -> String {
        Base64::encode_string(&self.public_key_der)
    }

    pub fn signing_key(&self) -> Result<SigningKey, KeyError> {
        signing_key_from_pem(&self.private_pem)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_pem", &"<redacted>")
            .field("public_pem", &self.public_pem)
            .finish()
    }
}

pub fn signing_key_from_pem(pem: &str) -> Result<SigningKey, KeyError> {
    SigningKey::from_pkcs8_pem(pem).map_err(|e| KeyError::Encoding {
        message: format!("private key parse error: {e}"),
    })
}

pub fn public_key_der(key: &VerifyingKey) -> Result<Vec<u8>, KeyError> {
    key.to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| KeyError::Encoding {
            message: e.to_string(),
        })
}

/// SHA-256 hex of the SPKI DER public key.
pub fn public_key_fingerprint(key: &VerifyingKey) -> Result<String, KeyError> {
    let der = public_key_der(key)?;
    Ok(Sha256::digest(&der)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Generates key pairs and guards private keys at rest.
pub struct KeyMaterialService {
    master: MasterKey,
    default_key_id: String,
    certificates: Arc<dyn CertificateStore>,
    audit: Arc<dyn AuditSink>,
}

impl KeyMaterialService {
    pub fn new(
        master: MasterKey,
        default_key_id: impl Into<String>,
        certificates: Arc<dyn CertificateStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            master,
            default_key_id: default_key_id.into(),
            certificates,
            audit,
        }
    }

    pub fn default_key_id(&self) -> &str {
        &self.default_key_id
    }

    pub fn generate_key_pair(&self, actor: &str) -> Result<KeyPair, KeyError> {
        let pair = KeyPair::generate();
        match &pair {
            Ok(_) => self
                .audit
                .log_action(AuditLogEntry::success(AuditAction::KeyGenerated, actor)),
            Err(e) => self
                .audit
                .log_action(AuditLogEntry::failure(AuditAction::KeyGenerated, actor, e)),
        }
        pair
    }

    /// Encrypt under the key derived for `key_id`. The key id is bound as
    /// associated data, so decrypting under another id fails the tag check.
    pub fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<EncryptedKey, KeyError> {
        let key = self.master.derive(key_id)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), key_id.as_bytes(), &mut buffer)
            .map_err(|e| KeyError::Encryption {
                message: e.to_string(),
            })?;

        Ok(EncryptedKey {
            ciphertext: buffer,
            iv: iv.to_vec(),
            auth_tag: tag.to_vec(),
            key_id: key_id.to_string(),
        })
    }

    pub fn encrypt_key_pair(&self, pair: &KeyPair) -> Result<EncryptedKey, KeyError> {
        self.encrypt(pair.private_pem().as_bytes(), &self.default_key_id)
    }

    /// Never returns unauthenticated plaintext.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        auth_tag: &[u8],
        key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let integrity = || KeyError::Integrity {
            key_id: key_id.to_string(),
        };
        if iv.len() != IV_LEN || auth_tag.len() != TAG_LEN {
            return Err(integrity());
        }
        let key = self.master.derive(key_id)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(iv),
                key_id.as_bytes(),
                buffer.as_mut_slice(),
                Tag::from_slice(auth_tag),
            )
            .map_err(|_| integrity())?;
        Ok(buffer)
    }

    pub fn decrypt_key(&self, encrypted: &EncryptedKey) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        self.decrypt(
            &encrypted.ciphertext,
            &encrypted.iv,
            &encrypted.auth_tag,
            &encrypted.key_id,
        )
    }

    /// Decrypt a certificate's private key PEM. Every attempt is audited.
    pub fn get_private_key(
        &self,
        certificate_id: Uuid,
        requester: &str,
    ) -> Result<Zeroizing<String>, KeyError> {
        let result = self.load_private_pem(certificate_id);
        let entry = match &result {
            Ok(_) => AuditLogEntry::success(AuditAction::PrivateKeyAccessed, requester),
            Err(e) => AuditLogEntry::failure(AuditAction::PrivateKeyAccessed, requester, e),
        };
        self.audit.log_action(entry.with_certificate(certificate_id));
        result
    }

    fn load_private_pem(&self, certificate_id: Uuid) -> Result<Zeroizing<String>, KeyError> {
        let certificate = self.certificates.get(certificate_id)?;
        let plaintext = self.decrypt_key(certificate.encrypted_key())?;
        let pem = std::str::from_utf8(&plaintext).map_err(|_| KeyError::Encoding {
            message: "private key is not valid UTF-8 PEM".into(),
        })?;
        Ok(Zeroizing::new(pem.to_string()))
    }

    /// Run `f` with the decoded signing key; the key is dropped before return.
    pub fn with_private_key<T>(
        &self,
        certificate_id: Uuid,
        requester: &str,
        f: impl FnOnce(&SigningKey) -> T,
    ) -> Result<T, KeyError> {
        let pem = self.get_private_key(certificate_id, requester)?;
        let key = signing_key_from_pem(&pem)?;
        Ok(f(&key))
    }

    /// Re-wrap an encrypted key under `new_key_id` without exposing it.
    pub fn reencrypt(
        &self,
        encrypted: &EncryptedKey,
        new_key_id: &str,
    ) -> Result<EncryptedKey, KeyError> {
        let plaintext = self.decrypt_key(encrypted)?;
        let rewrapped = self.encrypt(&plaintext, new_key_id)?;
        debug!(from = %encrypted.key_id, to = %new_key_id, "re-encrypted private key");
        Ok(rewrapped)
    }

    /// Move a stored certificate's key to `new_key_id`.
    pub fn reencrypt_certificate(
        &self,
        certificate_id: Uuid,
        new_key_id: &str,
        actor: &str,
    ) -> Result<(), KeyError> {
        let result = (|| {
            let certificate = self.certificates.get(certificate_id)?;
            let rewrapped = self.reencrypt(certificate.encrypted_key(), new_key_id)?;
            self.certificates.update(certificate_id, &mut |cert| {
                cert.replace_encrypted_key(rewrapped.clone());
                Ok(())
            })?;
            Ok::<(), KeyError>(())
        })();
        let entry = match &result {
            Ok(_) => AuditLogEntry::success(AuditAction::KeyReencrypted, actor)
                .with_detail(new_key_id.to_string()),
            Err(e) => AuditLogEntry::failure(AuditAction::KeyReencrypted, actor, e),
        };
        self.audit.log_action(entry.with_certificate(certificate_id));
        result
    }
}

impl fmt::Debug for KeyMaterialService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterialService")
            .field("master", &self.master)
            .field("default_key_id", &self.default_key_id)
            .finish_non_exhaustive()
    }
}
