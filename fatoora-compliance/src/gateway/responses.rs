//! Typed response bodies for each authority endpoint.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validation results container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationResults {
    #[serde(rename = "infoMessages", default)]
    info_messages: MessageList,
    #[serde(rename = "warningMessages", default)]
    warning_messages: Vec<ValidationMessage>,
    #[serde(rename = "errorMessages", default)]
    error_messages: Vec<ValidationMessage>,
    #[serde(default)]
    status: Option<String>,
}

impl ValidationResults {
    pub fn info_messages(&self) -> &MessageList {
        &self.info_messages
    }

    pub fn warning_messages(&self) -> &[ValidationMessage] {
        &self.warning_messages
    }

    pub fn error_messages(&self) -> &[ValidationMessage] {
        &self.error_messages
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn has_errors(&self) -> bool {
        !self.error_messages.is_empty()
    }

    /// Error messages present or an overall `ERROR` status.
    pub fn is_error(&self) -> bool {
        self.has_errors() || self.status.as_deref() == Some("ERROR")
    }
}

/// Validation message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationMessage {
    #[serde(rename = "type")]
    message_type: Option<String>,
    code: Option<String>,
    category: Option<String>,
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl ValidationMessage {
    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

/// The authority sends either a single info object or a list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum MessageList {
    One(ValidationMessage),
    Many(Vec<ValidationMessage>),
    #[default]
    Empty,
}

impl MessageList {
    pub fn as_slice(&self) -> &[ValidationMessage] {
        match self {
            MessageList::One(message) => std::slice::from_ref(message),
            MessageList::Many(list) => list,
            MessageList::Empty => &[],
        }
    }
}

/// Onboarding, production issuance and renewal all answer with a CSID.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsidResponse {
    #[serde(rename = "requestID")]
    request_id: Option<u64>,
    #[serde(rename = "dispositionMessage", default)]
    disposition_message: Option<String>,
    #[serde(rename = "binarySecurityToken")]
    binary_security_token: String,
    secret: String,
    #[serde(rename = "tokenType", default)]
    token_type: Option<String>,
    #[serde(rename = "tokenExpiry", default)]
    token_expiry: Option<DateTime<Utc>>,
}

impl CsidResponse {
    pub fn new(
        request_id: Option<u64>,
        binary_security_token: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            disposition_message: None,
            binary_security_token: binary_security_token.into(),
            secret: secret.into(),
            token_type: None,
            token_expiry: None,
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    pub fn disposition_message(&self) -> Option<&str> {
        self.disposition_message.as_deref()
    }

    pub fn binary_security_token(&self) -> &str {
        &self.binary_security_token
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.token_expiry
    }
}

impl std::fmt::Debug for CsidResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsidResponse")
            .field("request_id", &self.request_id)
            .field("disposition_message", &self.disposition_message)
            .field("token_type", &self.token_type)
            .field("token_expiry", &self.token_expiry)
            .finish_non_exhaustive()
    }
}

/// Renewal responses are sometimes wrapped in `{"value": ...}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RenewalResponseBody {
    Direct(CsidResponse),
    Wrapped { value: CsidResponse },
}

impl RenewalResponseBody {
    pub(crate) fn into_inner(self) -> CsidResponse {
        match self {
            RenewalResponseBody::Direct(value) | RenewalResponseBody::Wrapped { value } => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceResponse {
    #[serde(rename = "validationResults", default)]
    validation_results: ValidationResults,
    #[serde(rename = "clearanceStatus")]
    clearance_status: Option<String>,
    /// Base64 invoice as stamped by the authority.
    #[serde(rename = "clearedInvoice", default)]
    cleared_invoice: Option<String>,
}

impl ClearanceResponse {
    pub fn validation_results(&self) -> &ValidationResults {
        &self.validation_results
    }

    pub fn clearance_status(&self) -> Option<&str> {
        self.clearance_status.as_deref()
    }

    pub fn cleared_invoice(&self) -> Option<&str> {
        self.cleared_invoice.as_deref()
    }

    pub fn warnings(&self) -> &[ValidationMessage] {
        self.validation_results.warning_messages()
    }

    pub fn is_cleared(&self) -> bool {
        self.clearance_status.as_deref() == Some("CLEARED")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingResponse {
    #[serde(rename = "validationResults", default)]
    validation_results: ValidationResults,
    #[serde(rename = "reportingStatus")]
    reporting_status: Option<String>,
}

impl ReportingResponse {
    pub fn validation_results(&self) -> &ValidationResults {
        &self.validation_results
    }

    pub fn reporting_status(&self) -> Option<&str> {
        self.reporting_status.as_deref()
    }

    pub fn warnings(&self) -> &[ValidationMessage] {
        self.validation_results.warning_messages()
    }

    pub fn is_reported(&self) -> bool {
        self.reporting_status.as_deref() == Some("REPORTED")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCheckResponse {
    #[serde(rename = "validationResults", default)]
    validation_results: ValidationResults,
    #[serde(rename = "reportingStatus", default)]
    reporting_status: Option<String>,
    #[serde(rename = "clearanceStatus", default)]
    clearance_status: Option<String>,
    #[serde(rename = "qrSellertStatus", default)]
    qr_seller_status: Option<String>,
    #[serde(rename = "qrBuyertStatus", default)]
    qr_buyer_status: Option<String>,
}

impl ComplianceCheckResponse {
    pub fn validation_results(&self) -> &ValidationResults {
        &self.validation_results
    }

    pub fn reporting_status(&self) -> Option<&str> {
        self.reporting_status.as_deref()
    }

    pub fn clearance_status(&self) -> Option<&str> {
        self.clearance_status.as_deref()
    }

    pub fn qr_seller_status(&self) -> Option<&str> {
        self.qr_seller_status.as_deref()
    }

    pub fn qr_buyer_status(&self) -> Option<&str> {
        self.qr_buyer_status.as_deref()
    }

    pub fn warnings(&self) -> &[ValidationMessage] {
        self.validation_results.warning_messages()
    }
}

/// Refusals the authority can send with a 2xx status.
pub(crate) trait Verdict {
    /// Validation results behind a refusal, `None` when accepted.
    fn refusal(&self) -> Option<&ValidationResults> {
        None
    }
}

impl Verdict for CsidResponse {}

impl Verdict for RenewalResponseBody {}

impl Verdict for ClearanceResponse {
    fn refusal(&self) -> Option<&ValidationResults> {
        (!self.is_cleared() || self.validation_results.is_error()).then_some(&self.validation_results)
    }
}

impl Verdict for ReportingResponse {
    fn refusal(&self) -> Option<&ValidationResults> {
        (!self.is_reported() || self.validation_results.is_error())
            .then_some(&self.validation_results)
    }
}

impl Verdict for ComplianceCheckResponse {
    fn refusal(&self) -> Option<&ValidationResults> {
        self.validation_results
            .is_error()
            .then_some(&self.validation_results)
    }
}

/// Body of a `401` response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnauthorizedResponse {
    timestamp: Option<i64>,
    status: Option<u16>,
    error: Option<String>,
    message: Option<String>,
}

impl UnauthorizedResponse {
    pub(crate) fn from_body(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| UnauthorizedResponse {
            timestamp: None,
            status: Some(401),
            error: Some("Unauthorized".into()),
            message: Some(body.to_string()),
        })
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Validation results embedded in an error body, if it carries any.
pub(crate) fn validation_from_body(body: &str) -> Option<ValidationResults> {
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(rename = "validationResults")]
        validation_results: Option<ValidationResults>,
    }
    serde_json::from_str::<Envelope>(body)
        .ok()
        .and_then(|envelope| envelope.validation_results)
}
