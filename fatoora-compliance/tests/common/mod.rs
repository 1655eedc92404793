#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use fatoora_compliance::Amount;
use fatoora_compliance::audit::MemoryAuditSink;
use fatoora_compliance::certificate::{CertificateLeases, InMemoryCertificateStore, InvoiceCategory};
use fatoora_compliance::chain::{InMemoryChainStore, InvoiceHashChain};
use fatoora_compliance::config::{Config, EnvironmentType, RateLimitSettings, RetryPolicy};
use fatoora_compliance::csr::CsrConfig;
use fatoora_compliance::gateway::{ComplianceGateway, RateLimiter};
use fatoora_compliance::keys::{KeyMaterialService, MasterKey};
use fatoora_compliance::lifecycle::{CertificateLifecycleManager, RenewalSignal};
use fatoora_compliance::router::{Invoice, SubmissionRouter};
use fatoora_compliance::stamp::{CryptographicStamper, InMemorySigningLedger};
use httpmock::MockServer;
use tokio::sync::mpsc;

pub const ORG: &str = "org-399999999900003";

pub const CSID: &str = r#"{
    "requestID": 1234567890123,
    "dispositionMessage": "ISSUED",
    "binarySecurityToken": "TUlJQ0lqQ0NBY2VnQXdJQkFnSUdBWkE=",
    "secret": "Dehvg1fc8GF6Jwt5bOxXwC6en",
    "tokenType": "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509v3"
}"#;

pub const PRODUCTION_CSID: &str = r#"{
    "requestID": 30368,
    "dispositionMessage": "ISSUED",
    "binarySecurityToken": "VFVsSlJERjZRME5CTTJsblowRjNTVUpCWjBsVVpVRkJRVUZDVlE9PQ==",
    "secret": "CkYsEXfV8c1gFHAtFWoZv73pGMvh/Qyo4LzKM2h/8Hg=",
    "tokenType": "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509v3"
}"#;

pub const CLEARED: &str = r#"{
    "validationResults": {"infoMessages": [], "warningMessages": [], "errorMessages": [], "status": "PASS"},
    "clearanceStatus": "CLEARED",
    "clearedInvoice": "PEludm9pY2UvPg=="
}"#;

pub const REPORTED: &str = r#"{
    "validationResults": {"status": "PASS"},
    "reportingStatus": "REPORTED"
}"#;

pub fn try_start_server() -> Option<MockServer> {
    std::panic::catch_unwind(MockServer::start).ok()
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn identity() -> CsrConfig {
    CsrConfig::from_properties(&fixture("csr-config.properties")).expect("csr config fixture")
}

/// The fixture invoice with a distinct document id.
pub fn invoice_xml(number: u32) -> String {
    std::fs::read_to_string(fixture("simplified-invoice.xml"))
        .expect("invoice fixture")
        .replace("<cbc:ID>SME00010</cbc:ID>", &format!("<cbc:ID>SME{number:05}</cbc:ID>"))
}

pub fn invoice(number: u32, category: InvoiceCategory, total: &str) -> Invoice {
    let total_with_vat: Amount = total.parse().expect("total");
    Invoice {
        organization_id: ORG.into(),
        category,
        uuid: format!("8e6000cf-1a98-4174-b3e7-{number:012}"),
        issued_at: chrono::Utc
            .with_ymd_and_hms(2024, 1, 14, 10, 26, 49)
            .single()
            .expect("timestamp"),
        seller_name: "Maximum Speed Tech Supply LTD".into(),
        vat_number: "399999999900003".into(),
        total_with_vat,
        vat_total: Amount::from_halalas(total_with_vat.halalas() * 15 / 115),
        xml: invoice_xml(number),
    }
}

/// Every service wired together against a mock authority.
pub struct Pipeline {
    pub config: Config,
    pub limiter: Arc<RateLimiter>,
    pub store: Arc<InMemoryCertificateStore>,
    pub chain: Arc<InvoiceHashChain>,
    pub ledger: Arc<InMemorySigningLedger>,
    pub audit: Arc<MemoryAuditSink>,
    pub lifecycle: Arc<CertificateLifecycleManager>,
    pub router: SubmissionRouter,
}

impl Pipeline {
    pub fn new(server: &MockServer) -> Self {
        Self::build(server, None)
    }

    /// Like [`Pipeline::new`], with sweep renewal signals delivered to the
    /// returned receiver.
    pub fn with_renewals(server: &MockServer) -> (Self, mpsc::Receiver<RenewalSignal>) {
        let (sender, receiver) = mpsc::channel(8);
        (Self::build(server, Some(sender)), receiver)
    }

    fn build(server: &MockServer, renewals: Option<mpsc::Sender<RenewalSignal>>) -> Self {
        let mut config = Config::new(EnvironmentType::NonProduction);
        config.gateway.base_url = Some(format!("{}/", server.base_url()));
        config.retry = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
        };
        config.rate_limit = RateLimitSettings {
            enabled: true,
            capacity: 100,
            window: Duration::from_secs(60),
        };

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let store = Arc::new(InMemoryCertificateStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let leases = Arc::new(CertificateLeases::new());
        let keys = Arc::new(KeyMaterialService::new(
            MasterKey::from_bytes([11u8; 32]),
            "pipeline",
            store.clone(),
            audit.clone(),
        ));
        let gateway =
            Arc::new(ComplianceGateway::new(config.clone(), limiter.clone()).expect("gateway"));
        let chain = Arc::new(InvoiceHashChain::new(Arc::new(InMemoryChainStore::new())));
        let ledger = Arc::new(InMemorySigningLedger::new());

        let mut lifecycle = CertificateLifecycleManager::new(
            config.rotation.clone(),
            keys.clone(),
            store.clone(),
            leases.clone(),
            gateway.clone(),
            audit.clone(),
        );
        if let Some(sender) = renewals {
            lifecycle = lifecycle.with_renewal_channel(sender);
        }
        let lifecycle = Arc::new(lifecycle);
        let router = SubmissionRouter::new(
            config.clearance_threshold,
            chain.clone(),
            store.clone(),
            leases,
            keys,
            Arc::new(CryptographicStamper::new(ledger.clone())),
            gateway,
            audit.clone(),
        );

        Self {
            config,
            limiter,
            store,
            chain,
            ledger,
            audit,
            lifecycle,
            router,
        }
    }
}
