mod common;

use chrono::{Duration, Utc};
use common::{
    CSID, ORG, PRODUCTION_CSID, Pipeline, REPORTED, identity, invoice, runtime, try_start_server,
};
use fatoora_compliance::audit::AuditAction;
use fatoora_compliance::certificate::{CertificateStatus, CertificateStore, CertificateType, InvoiceCategory};
use fatoora_compliance::gateway::GatewayError;
use fatoora_compliance::lifecycle::LifecycleError;
use fatoora_compliance::router::RouterError;
use httpmock::Method::{PATCH, POST};

const RENEWED_CSID: &str = r#"{
    "requestID": 30369,
    "dispositionMessage": "ISSUED",
    "binarySecurityToken": "UkVORVdFRF9UT0tFTg==",
    "secret": "renewed-secret"
}"#;

fn signing_count(pipeline: &Pipeline, category: InvoiceCategory) -> usize {
    pipeline
        .store
        .list()
        .iter()
        .filter(|cert| cert.is_signing() && cert.organization_id() == ORG && cert.category() == category)
        .count()
}

#[test]
fn onboarding_issues_compliance_then_production() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let compliance_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/compliance")
            .header("OTP", "123345")
            .body_contains("\"csr\"");
        then.status(200)
            .header("content-type", "application/json")
            .body(CSID);
    });
    let production_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/production/csids")
            .header_exists("authorization");
        then.status(200)
            .header("content-type", "application/json")
            .body(PRODUCTION_CSID);
    });

    let pipeline = Pipeline::new(&server);
    let (compliance, production) = runtime().block_on(async {
        let compliance = pipeline
            .lifecycle
            .onboard_compliance(ORG, &identity(), InvoiceCategory::Simplified, "123345")
            .await
            .expect("compliance");
        let production = pipeline
            .lifecycle
            .request_production(compliance.id(), None)
            .await
            .expect("production");
        (compliance, production)
    });

    compliance_mock.assert_hits(1);
    production_mock.assert_hits(1);

    assert_eq!(compliance.certificate_type(), CertificateType::Compliance);
    assert_eq!(compliance.status(), CertificateStatus::Active);
    assert!(compliance.is_signing());
    assert_eq!(compliance.request_id(), Some(1234567890123));

    assert_eq!(production.certificate_type(), CertificateType::Production);
    assert!(production.is_signing());
    assert_eq!(production.csr_fingerprint(), compliance.csr_fingerprint());

    // Production takes over signing; the compliance certificate stays usable
    // for compliance checks only.
    let stored = pipeline.store.get(compliance.id()).expect("compliance");
    assert_eq!(stored.status(), CertificateStatus::Active);
    assert!(!stored.is_signing());
    assert_eq!(signing_count(&pipeline, InvoiceCategory::Simplified), 1);
    assert_eq!(production.encrypted_key(), compliance.encrypted_key());

    // Tokens without a decodable validity window get the default lifetime.
    let valid_to = production.valid_to().expect("valid_to");
    let days = (valid_to - Utc::now()).num_days();
    assert!((364..=365).contains(&days), "unexpected validity: {days} days");

    assert_eq!(pipeline.audit.entries_for(AuditAction::CsrBuilt).len(), 1);
    assert_eq!(pipeline.audit.entries_for(AuditAction::ComplianceOnboarded).len(), 1);
    assert_eq!(pipeline.audit.entries_for(AuditAction::ProductionIssued).len(), 1);
    assert_eq!(pipeline.audit.entries_for(AuditAction::CertificateActivated).len(), 2);
}

#[test]
fn failed_onboarding_marks_certificate_failed() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path("/compliance");
        then.status(400)
            .header("content-type", "application/json")
            .body(r#"{"errors": [{"code": "Invalid-OTP", "message": "The provided OTP is invalid"}]}"#);
    });

    let pipeline = Pipeline::new(&server);
    let err = runtime()
        .block_on(pipeline.lifecycle.onboard_compliance(
            ORG,
            &identity(),
            InvoiceCategory::Simplified,
            "000000",
        ))
        .expect_err("rejected");
    assert!(matches!(
        err,
        LifecycleError::Gateway(GatewayError::RejectedByAuthority { status: 400, .. })
    ));

    let certificates = pipeline.store.list();
    assert_eq!(certificates.len(), 1);
    assert_eq!(certificates[0].status(), CertificateStatus::Failed);
    assert!(!certificates[0].is_signing());
    assert!(
        certificates[0]
            .failure_reason()
            .expect("reason")
            .contains("400")
    );

    let onboarded = pipeline.audit.entries_for(AuditAction::ComplianceOnboarded);
    assert_eq!(onboarded.len(), 1);
    assert!(!onboarded[0].success);
}

#[test]
fn rotation_hands_signing_to_successor() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path("/compliance");
        then.status(200)
            .header("content-type", "application/json")
            .body(CSID);
    });
    server.mock(|when, then| {
        when.method(POST).path("/production/csids");
        then.status(200)
            .header("content-type", "application/json")
            .body(PRODUCTION_CSID);
    });
    let renewal = server.mock(|when, then| {
        when.method(PATCH)
            .path("/production/csids")
            .header("OTP", "654321")
            .header_exists("authorization");
        then.status(200)
            .header("content-type", "application/json")
            .body(RENEWED_CSID);
    });
    server.mock(|when, then| {
        when.method(POST).path("/invoices/reporting/single");
        then.status(200)
            .header("content-type", "application/json")
            .body(REPORTED);
    });

    let pipeline = Pipeline::new(&server);
    let rt = runtime();
    let (predecessor, successor, first, second) = rt.block_on(async {
        let compliance = pipeline
            .lifecycle
            .onboard_compliance(ORG, &identity(), InvoiceCategory::Simplified, "123345")
            .await
            .expect("compliance");
        let predecessor = pipeline
            .lifecycle
            .request_production(compliance.id(), None)
            .await
            .expect("production");
        let first = pipeline
            .router
            .submit(&invoice(1, InvoiceCategory::Simplified, "4.60"))
            .await
            .expect("first");

        let successor = pipeline
            .lifecycle
            .rotate(predecessor.id(), &identity(), "654321")
            .await
            .expect("rotated");
        let second = pipeline
            .router
            .submit(&invoice(2, InvoiceCategory::Simplified, "4.60"))
            .await
            .expect("second");
        (predecessor, successor, first, second)
    });

    renewal.assert_hits(1);
    assert_eq!(successor.predecessor(), Some(predecessor.id()));
    assert!(successor.is_signing());
    assert_ne!(successor.encrypted_key(), predecessor.encrypted_key());
    assert_eq!(successor.request_id(), Some(30369));

    let old = pipeline.store.get(predecessor.id()).expect("predecessor");
    assert_eq!(old.status(), CertificateStatus::Active);
    assert!(!old.is_signing());

    assert_eq!(first.certificate_id, predecessor.id());
    assert_eq!(second.certificate_id, successor.id());
    // The chain is per organization and category, not per certificate.
    assert_eq!(second.previous_invoice_hash, first.invoice_hash);
    assert_ne!(first.stamp.public_key, second.stamp.public_key);

    assert_eq!(pipeline.audit.entries_for(AuditAction::CertificateRotated).len(), 1);
}

#[test]
fn failed_rotation_keeps_predecessor_signing() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path("/compliance");
        then.status(200)
            .header("content-type", "application/json")
            .body(CSID);
    });
    server.mock(|when, then| {
        when.method(POST).path("/production/csids");
        then.status(200)
            .header("content-type", "application/json")
            .body(PRODUCTION_CSID);
    });
    let renewal = server.mock(|when, then| {
        when.method(PATCH).path("/production/csids");
        then.status(400)
            .header("content-type", "application/json")
            .body(r#"{"errors": [{"code": "Invalid-OTP", "message": "The provided OTP is invalid"}]}"#);
    });
    let reporting = server.mock(|when, then| {
        when.method(POST).path("/invoices/reporting/single");
        then.status(200)
            .header("content-type", "application/json")
            .body(REPORTED);
    });

    let pipeline = Pipeline::new(&server);
    let (predecessor, outcome) = runtime().block_on(async {
        let compliance = pipeline
            .lifecycle
            .onboard_compliance(ORG, &identity(), InvoiceCategory::Simplified, "123345")
            .await
            .expect("compliance");
        let predecessor = pipeline
            .lifecycle
            .request_production(compliance.id(), None)
            .await
            .expect("production");

        let err = pipeline
            .lifecycle
            .rotate(predecessor.id(), &identity(), "000000")
            .await
            .expect_err("renewal rejected");
        assert!(matches!(err, LifecycleError::Gateway(_)));

        let outcome = pipeline
            .router
            .submit(&invoice(1, InvoiceCategory::Simplified, "4.60"))
            .await
            .expect("still signing with predecessor");
        (predecessor, outcome)
    });

    renewal.assert_hits(1);
    reporting.assert_hits(1);
    assert_eq!(outcome.certificate_id, predecessor.id());
    assert!(pipeline.store.get(predecessor.id()).expect("predecessor").is_signing());

    let failed: Vec<_> = pipeline
        .store
        .list()
        .into_iter()
        .filter(|cert| cert.predecessor() == Some(predecessor.id()))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status(), CertificateStatus::Failed);
}

#[test]
fn expired_certificates_stop_signing() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path("/compliance");
        then.status(200)
            .header("content-type", "application/json")
            .body(CSID);
    });
    server.mock(|when, then| {
        when.method(POST).path("/production/csids");
        then.status(200)
            .header("content-type", "application/json")
            .body(PRODUCTION_CSID);
    });
    let reporting = server.mock(|when, then| {
        when.method(POST).path("/invoices/reporting/single");
        then.status(200).body(REPORTED);
    });

    let (pipeline, mut renewals) = Pipeline::with_renewals(&server);
    let rt = runtime();
    let production = rt.block_on(async {
        let compliance = pipeline
            .lifecycle
            .onboard_compliance(ORG, &identity(), InvoiceCategory::Simplified, "123345")
            .await
            .expect("compliance");
        pipeline
            .lifecycle
            .request_production(compliance.id(), None)
            .await
            .expect("production")
    });

    let report = pipeline.lifecycle.sweep(Utc::now() + Duration::days(350));
    assert_eq!(report.checked, 2);
    assert!(report.expired.is_empty());
    // Only the signing certificate asks for renewal.
    assert_eq!(report.renewals_due.len(), 1);
    assert_eq!(report.renewals_due[0].certificate_id, production.id());
    assert!(report.renewals_due[0].days_until_expiry <= 15);

    let report = pipeline.lifecycle.sweep(Utc::now() + Duration::days(400));
    assert_eq!(report.expired.len(), 2);
    assert_eq!(pipeline.audit.entries_for(AuditAction::CertificateExpired).len(), 2);

    let mut signalled = Vec::new();
    while let Ok(signal) = renewals.try_recv() {
        signalled.push(signal.certificate_id);
    }
    assert_eq!(signalled, vec![production.id()]);

    let stored = pipeline.store.get(production.id()).expect("production");
    assert_eq!(stored.status(), CertificateStatus::Expired);
    assert!(!stored.is_signing());

    let err = rt
        .block_on(
            pipeline
                .router
                .submit(&invoice(1, InvoiceCategory::Simplified, "4.60")),
        )
        .expect_err("no signing certificate");
    assert!(matches!(err, RouterError::NoSigningCertificate { .. }));
    reporting.assert_hits(0);
}

#[test]
fn revoked_certificate_cannot_be_reactivated() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path("/compliance");
        then.status(200)
            .header("content-type", "application/json")
            .body(CSID);
    });

    let pipeline = Pipeline::new(&server);
    let compliance = runtime()
        .block_on(pipeline.lifecycle.onboard_compliance(
            ORG,
            &identity(),
            InvoiceCategory::Standard,
            "123345",
        ))
        .expect("compliance");

    let revoked = pipeline
        .lifecycle
        .revoke(compliance.id(), "operator", "key compromised")
        .expect("revoke");
    assert_eq!(revoked.status(), CertificateStatus::Revoked);
    assert!(!revoked.is_signing());

    assert!(pipeline.lifecycle.activate(compliance.id(), "operator").is_err());
    assert!(
        pipeline
            .lifecycle
            .revoke(compliance.id(), "operator", "again")
            .is_err()
    );
    assert!(
        pipeline
            .store
            .find_signing(ORG, InvoiceCategory::Standard, CertificateType::Compliance)
            .is_none()
    );
}

#[test]
fn rotating_an_idle_certificate_leaves_the_signer_alone() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path("/compliance");
        then.status(200)
            .header("content-type", "application/json")
            .body(CSID);
    });
    server.mock(|when, then| {
        when.method(POST).path("/production/csids");
        then.status(200)
            .header("content-type", "application/json")
            .body(PRODUCTION_CSID);
    });
    let renewal = server.mock(|when, then| {
        when.method(PATCH).path("/production/csids");
        then.status(200)
            .header("content-type", "application/json")
            .body(RENEWED_CSID);
    });

    let pipeline = Pipeline::new(&server);
    let (signing, idle, successor) = runtime().block_on(async {
        let compliance = pipeline
            .lifecycle
            .onboard_compliance(ORG, &identity(), InvoiceCategory::Simplified, "123345")
            .await
            .expect("compliance");
        let signing = pipeline
            .lifecycle
            .request_production(compliance.id(), None)
            .await
            .expect("first production");
        let idle = pipeline
            .lifecycle
            .request_production(compliance.id(), None)
            .await
            .expect("second production");
        assert!(!idle.is_signing());

        let successor = pipeline
            .lifecycle
            .rotate(idle.id(), &identity(), "654321")
            .await
            .expect("rotated");
        (signing, idle, successor)
    });

    renewal.assert_hits(1);
    assert_eq!(successor.status(), CertificateStatus::Active);
    assert!(!successor.is_signing());
    assert!(!pipeline.store.get(idle.id()).expect("idle").is_signing());
    assert!(pipeline.store.get(signing.id()).expect("signing").is_signing());
    assert_eq!(signing_count(&pipeline, InvoiceCategory::Simplified), 1);
}
