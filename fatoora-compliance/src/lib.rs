//! ZATCA e-invoicing compliance pipeline: certificate lifecycle, invoice hash
//! chaining, ECDSA stamping, QR payloads and rate-limited gateway submission.
//!
//! # Examples
//! ```rust
//! use fatoora_compliance::config::{Config, EnvironmentType};
//! use fatoora_compliance::chain::{hash_invoice, GENESIS_HASH};
//!
//! let config = Config::new(EnvironmentType::NonProduction);
//! let hash = hash_invoice("<Invoice><ID>1</ID></Invoice>", GENESIS_HASH)?;
//! assert_eq!(hash.len(), 44);
//! # let _ = config;
//! # Ok::<(), fatoora_compliance::Error>(())
//! ```
pub mod amount;
pub mod audit;
pub mod certificate;
pub mod chain;
pub mod config;
pub mod csr;
pub mod gateway;
pub mod keys;
pub mod lifecycle;
pub mod qr;
pub mod router;
pub mod scheduler;
pub mod stamp;

pub use amount::Amount;

use thiserror::Error;

/// Top-level error wrapper for pipeline operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Key(#[from] keys::KeyError),
    #[error(transparent)]
    Csr(#[from] csr::CsrError),
    #[error(transparent)]
    Chain(#[from] chain::ChainError),
    #[error(transparent)]
    Stamp(#[from] stamp::StampError),
    #[error(transparent)]
    Qr(#[from] qr::QrCodeError),
    #[error(transparent)]
    Gateway(#[from] gateway::GatewayError),
    #[error(transparent)]
    Router(#[from] router::RouterError),
    #[error(transparent)]
    Lifecycle(#[from] lifecycle::LifecycleError),
}
