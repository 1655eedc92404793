//! Rate-limited, retrying HTTP client for the authority's endpoints.
mod rate_limit;
mod responses;
pub mod retry;

pub use rate_limit::RateLimiter;
pub use responses::{
    ClearanceResponse, ComplianceCheckResponse, CsidResponse, MessageList, ReportingResponse,
    UnauthorizedResponse, ValidationMessage, ValidationResults,
};

use crate::certificate::IssuedToken;
use crate::config::{Config, EnvironmentType};
use crate::csr::CsrBundle;
use base64ct::{Base64, Encoding};
use reqwest::{Client, RequestBuilder, StatusCode};
use responses::{RenewalResponseBody, Verdict, validation_from_body};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by the gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exhausted, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("rejected by authority (status {status})")]
    RejectedByAuthority {
        status: u16,
        validation: Option<ValidationResults>,
        body: String,
    },

    #[error("unauthorized: {0:?}")]
    Unauthorized(UnauthorizedResponse),

    #[error("submission failed after {attempts} attempts: {last_error}")]
    SubmissionFailed {
        attempts: u32,
        #[source]
        last_error: Box<GatewayError>,
    },

    #[error("server error (status {status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response from authority: {0}")]
    InvalidResponse(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("client state error: {0}")]
    ClientState(String),
}

impl GatewayError {
    /// Failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::ServerError { .. } | GatewayError::Timeout | GatewayError::Transport(_)
        )
    }

    fn from_send(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            GatewayError::Timeout
        } else if error.is_connect() || error.is_request() || error.is_body() {
            GatewayError::Transport(error.to_string())
        } else {
            GatewayError::Http(error)
        }
    }
}

/// Marker trait for token scope, either Compliance (CCSID) or Production (PCSID).
pub trait TokenScope {}
/// Compliance (CCSID) token scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Compliance;
/// Production (PCSID) token scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Production;
impl TokenScope for Compliance {}
impl TokenScope for Production {}

/// Basic-auth credentials for one environment and token scope.
///
/// # Examples
/// ```rust
/// use fatoora_compliance::gateway::{CsidCredentials, Compliance};
/// use fatoora_compliance::config::EnvironmentType;
///
/// let creds = CsidCredentials::<Compliance>::new(
///     EnvironmentType::NonProduction,
///     Some(1234567890123),
///     "TUlJQ1BUQ0NBZU9nQXdJQkFnS....",
///     "Dehvg1fc8GF6Jwt5bOxXwC6en....",
/// );
/// assert!(!format!("{creds:?}").contains("Dehvg1fc8GF6"));
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CsidCredentials<T> {
    env: EnvironmentType,
    request_id: Option<u64>,
    binary_security_token: String,
    secret: String,
    _marker: PhantomData<T>,
}

impl<T: TokenScope> CsidCredentials<T> {
    pub fn new(
        env: EnvironmentType,
        request_id: Option<u64>,
        binary_security_token: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            env,
            request_id,
            binary_security_token: binary_security_token.into(),
            secret: secret.into(),
            _marker: PhantomData,
        }
    }

    pub fn from_token(env: EnvironmentType, token: &IssuedToken) -> Self {
        Self::new(
            env,
            token.request_id,
            token.binary_security_token.clone(),
            token.secret.clone(),
        )
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    pub fn binary_security_token(&self) -> &str {
        &self.binary_security_token
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl<T> fmt::Debug for CsidCredentials<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsidCredentials")
            .field("env", &self.env)
            .field("request_id", &self.request_id)
            .field("binary_security_token", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl CsidResponse {
    pub fn into_credentials<T: TokenScope>(self, env: EnvironmentType) -> CsidCredentials<T> {
        CsidCredentials::new(
            env,
            self.request_id(),
            self.binary_security_token().to_string(),
            self.secret().to_string(),
        )
    }

    pub fn issued_token(&self) -> IssuedToken {
        IssuedToken {
            request_id: self.request_id(),
            binary_security_token: self.binary_security_token().to_string(),
            secret: self.secret().to_string(),
        }
    }
}

/// JSON body shared by clearance, reporting and compliance checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSubmission {
    pub invoice_hash: String,
    pub uuid: String,
    /// Base64 of the signed invoice XML.
    pub invoice: String,
}

impl InvoiceSubmission {
    pub fn new(invoice_hash: impl Into<String>, uuid: impl Into<String>, xml: &str) -> Self {
        Self {
            invoice_hash: invoice_hash.into(),
            uuid: uuid.into(),
            invoice: Base64::encode_string(xml.as_bytes()),
        }
    }
}

/// Client for the authority's gateway.
///
/// # Examples
/// ```rust,no_run
/// use std::sync::Arc;
/// use fatoora_compliance::config::Config;
/// use fatoora_compliance::gateway::{ComplianceGateway, GatewayError, RateLimiter};
///
/// let config = Config::default();
/// let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
/// let gateway = ComplianceGateway::new(config, limiter)?;
/// # let _ = gateway;
/// # Ok::<(), GatewayError>(())
/// ```
#[derive(Debug)]
pub struct ComplianceGateway {
    config: Config,
    client: Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl ComplianceGateway {
    /// # Errors
    /// Returns [`GatewayError::Http`] if the HTTP client cannot be built.
    pub fn new(config: Config, limiter: Arc<RateLimiter>) -> Result<Self, GatewayError> {
        let client = Client::builder().build()?;
        let base_url = config.base_url();
        Ok(Self {
            config,
            client,
            base_url,
            limiter,
        })
    }

    pub fn env(&self) -> EnvironmentType {
        self.config.env()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Exchange a CSR and one-time code for a compliance CSID.
    pub async fn onboard_compliance(
        &self,
        csr: &CsrBundle,
        otp: &str,
    ) -> Result<CsidResponse, GatewayError> {
        let payload = serde_json::json!({ "csr": csr.pem_base64() });
        let url = self.build_endpoint("compliance");
        let response: CsidResponse = self
            .send("compliance", self.config.gateway.default_timeout, || {
                self.request(self.client.post(&url))
                    .header("OTP", otp)
                    .json(&payload)
            })
            .await?;
        info!(request_id = ?response.request_id(), "compliance CSID issued");
        Ok(response)
    }

    /// Exchange an active compliance CSID for a production CSID.
    pub async fn request_production(
        &self,
        ccsid: &CsidCredentials<Compliance>,
        otp: Option<&str>,
    ) -> Result<CsidResponse, GatewayError> {
        self.ensure_env(ccsid)?;
        let request_id = ccsid
            .request_id()
            .ok_or_else(|| GatewayError::ClientState("missing compliance request_id".into()))?;
        let payload = serde_json::json!({ "compliance_request_id": request_id });
        let url = self.build_endpoint("production/csids");
        let response: CsidResponse = self
            .send("production/csids", self.config.gateway.default_timeout, || {
                let mut request = self
                    .request(self.client.post(&url))
                    .basic_auth(ccsid.binary_security_token(), Some(ccsid.secret()))
                    .json(&payload);
                if let Some(otp) = otp {
                    request = request.header("OTP", otp);
                }
                request
            })
            .await?;
        info!(request_id = ?response.request_id(), "production CSID issued");
        Ok(response)
    }

    /// Renew a production CSID with a fresh CSR.
    pub async fn renew_production(
        &self,
        pcsid: &CsidCredentials<Production>,
        csr: &CsrBundle,
        otp: &str,
    ) -> Result<CsidResponse, GatewayError> {
        self.ensure_env(pcsid)?;
        let payload = serde_json::json!({ "csr": csr.pem_base64() });
        let url = self.build_endpoint("production/csids");
        let body: RenewalResponseBody = self
            .send("production/csids (renew)", self.config.gateway.default_timeout, || {
                self.request(self.client.patch(&url))
                    .header("OTP", otp)
                    .basic_auth(pcsid.binary_security_token(), Some(pcsid.secret()))
                    .json(&payload)
            })
            .await?;
        let response = body.into_inner();
        info!(request_id = ?response.request_id(), "production CSID renewed");
        Ok(response)
    }

    /// Synchronous clearance; the caller waits for the authority's decision.
    pub async fn clear(
        &self,
        pcsid: &CsidCredentials<Production>,
        submission: &InvoiceSubmission,
    ) -> Result<ClearanceResponse, GatewayError> {
        self.ensure_env(pcsid)?;
        let url = self.build_endpoint("invoices/clearance/single");
        self.send(
            "invoices/clearance/single",
            self.config.gateway.clearance_timeout,
            || {
                self.request(self.client.post(&url))
                    .header("Clearance-Status", "1")
                    .basic_auth(pcsid.binary_security_token(), Some(pcsid.secret()))
                    .json(submission)
            },
        )
        .await
    }

    /// Asynchronous reporting of a simplified or sub-threshold invoice.
    pub async fn report(
        &self,
        pcsid: &CsidCredentials<Production>,
        submission: &InvoiceSubmission,
    ) -> Result<ReportingResponse, GatewayError> {
        self.ensure_env(pcsid)?;
        let url = self.build_endpoint("invoices/reporting/single");
        self.send(
            "invoices/reporting/single",
            self.config.gateway.reporting_timeout,
            || {
                self.request(self.client.post(&url))
                    .header("Clearance-Status", "0")
                    .basic_auth(pcsid.binary_security_token(), Some(pcsid.secret()))
                    .json(submission)
            },
        )
        .await
    }

    /// Validate an invoice against the compliance endpoint.
    pub async fn check_compliance(
        &self,
        ccsid: &CsidCredentials<Compliance>,
        submission: &InvoiceSubmission,
    ) -> Result<ComplianceCheckResponse, GatewayError> {
        self.ensure_env(ccsid)?;
        let url = self.build_endpoint("compliance/invoices");
        self.send(
            "compliance/invoices",
            self.config.gateway.default_timeout,
            || {
                self.request(self.client.post(&url))
                    .basic_auth(ccsid.binary_security_token(), Some(ccsid.secret()))
                    .json(submission)
            },
        )
        .await
    }
}

// Private API
impl ComplianceGateway {
    fn build_endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    fn ensure_env<T>(&self, creds: &CsidCredentials<T>) -> Result<(), GatewayError> {
        if creds.env != self.config.env() {
            return Err(GatewayError::ClientState("CSID environment mismatch".into()));
        }
        Ok(())
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Accept", "application/json")
            .header("Accept-Version", "V2")
            .header("Content-Type", "application/json")
            .header("accept-language", self.accept_language())
    }

    fn accept_language(&self) -> &'static str {
        match self.config.gateway.accept_language.as_str() {
            "ar" => "ar",
            _ => "en",
        }
    }

    async fn send<T, B>(
        &self,
        label: &'static str,
        timeout: Duration,
        build: B,
    ) -> Result<T, GatewayError>
    where
        T: DeserializeOwned + Verdict,
        B: Fn() -> RequestBuilder,
    {
        retry::run(&self.config.retry, &self.limiter, label, |attempt| {
            let request = build().timeout(timeout);
            async move {
                debug!(endpoint = label, attempt, "sending gateway request");
                let response = request.send().await.map_err(GatewayError::from_send)?;
                let status = response.status();
                let body = response.text().await.map_err(GatewayError::from_send)?;
                interpret(status, &body)
            }
        })
        .await
    }
}

fn interpret<T: DeserializeOwned + Verdict>(
    status: StatusCode,
    body: &str,
) -> Result<T, GatewayError> {
    if status.is_success() {
        let parsed: T = serde_json::from_str(body)
            .map_err(|e| GatewayError::InvalidResponse(format!("status {status}: {e}")))?;
        // A 2xx answer can still refuse the invoice.
        if let Some(validation) = parsed.refusal() {
            return Err(GatewayError::RejectedByAuthority {
                status: status.as_u16(),
                validation: Some(validation.clone()),
                body: body.to_string(),
            });
        }
        return Ok(parsed);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(GatewayError::Unauthorized(UnauthorizedResponse::from_body(
            body,
        )));
    }
    if status.is_server_error() {
        return Err(GatewayError::ServerError {
            status: status.as_u16(),
            body: body.to_string(),
        });
    }
    if status.is_client_error() {
        return Err(GatewayError::RejectedByAuthority {
            status: status.as_u16(),
            validation: validation_from_body(body),
            body: body.to_string(),
        });
    }
    Err(GatewayError::InvalidResponse(format!(
        "unexpected status {status}: {body}"
    )))
}
