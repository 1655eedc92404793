mod common;

use common::{
    CLEARED, CSID, ORG, PRODUCTION_CSID, Pipeline, REPORTED, identity, invoice, runtime,
    try_start_server,
};
use fatoora_compliance::audit::AuditAction;
use fatoora_compliance::certificate::{Certificate, CertificateStore, InvoiceCategory};
use fatoora_compliance::chain::{ChainKey, GENESIS_HASH, verify_chain};
use fatoora_compliance::gateway::GatewayError;
use fatoora_compliance::qr;
use fatoora_compliance::router::RouterError;
use fatoora_compliance::stamp::{SigningLedger, verify_stamp};
use httpmock::Method::POST;
use httpmock::MockServer;

fn mock_onboarding(server: &MockServer) {
    server.mock(|when, then| {
        when.method(POST).path("/compliance").header("OTP", "123345");
        then.status(200)
            .header("content-type", "application/json")
            .body(CSID);
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/production/csids")
            .json_body_partial(r#"{"compliance_request_id": 1234567890123}"#);
        then.status(200)
            .header("content-type", "application/json")
            .body(PRODUCTION_CSID);
    });
}

async fn onboard(pipeline: &Pipeline, category: InvoiceCategory) -> (Certificate, Certificate) {
    let compliance = pipeline
        .lifecycle
        .onboard_compliance(ORG, &identity().for_category(category), category, "123345")
        .await
        .expect("compliance csid");
    let production = pipeline
        .lifecycle
        .request_production(compliance.id(), None)
        .await
        .expect("production csid");
    (compliance, production)
}

#[test]
fn invoices_are_routed_by_category_and_threshold() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    mock_onboarding(&server);
    let clearance = server.mock(|when, then| {
        when.method(POST)
            .path("/invoices/clearance/single")
            .header("Clearance-Status", "1");
        then.status(200)
            .header("content-type", "application/json")
            .body(CLEARED);
    });
    let reporting = server.mock(|when, then| {
        when.method(POST)
            .path("/invoices/reporting/single")
            .header("Clearance-Status", "0");
        then.status(200)
            .header("content-type", "application/json")
            .body(REPORTED);
    });

    let pipeline = Pipeline::new(&server);
    runtime().block_on(async {
        onboard(&pipeline, InvoiceCategory::Standard).await;
        onboard(&pipeline, InvoiceCategory::Simplified).await;

        let above = pipeline
            .router
            .submit(&invoice(1, InvoiceCategory::Standard, "1150.00"))
            .await
            .expect("standard above threshold");
        assert!(above.decision.is_clearance());

        let at = pipeline
            .router
            .submit(&invoice(2, InvoiceCategory::Standard, "1000.00"))
            .await
            .expect("standard at threshold");
        assert!(!at.decision.is_clearance());

        let simplified = pipeline
            .router
            .submit(&invoice(3, InvoiceCategory::Simplified, "5000.00"))
            .await
            .expect("simplified");
        assert!(!simplified.decision.is_clearance());
        assert_eq!(simplified.previous_invoice_hash, GENESIS_HASH);
        assert_eq!(simplified.counter, 1);
    });

    clearance.assert_hits(1);
    reporting.assert_hits(2);

    let standard = pipeline
        .chain
        .head(&ChainKey::new(ORG, InvoiceCategory::Standard));
    assert_eq!(standard.counter, 2);
    assert_eq!(pipeline.audit.entries_for(AuditAction::InvoiceCleared).len(), 1);
    assert_eq!(pipeline.audit.entries_for(AuditAction::InvoiceReported).len(), 2);
}

#[test]
fn accepted_invoices_form_a_verifiable_chain() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    mock_onboarding(&server);
    server.mock(|when, then| {
        when.method(POST).path("/invoices/reporting/single");
        then.status(200)
            .header("content-type", "application/json")
            .body(REPORTED);
    });

    let pipeline = Pipeline::new(&server);
    let outcomes = runtime().block_on(async {
        let (_, production) = onboard(&pipeline, InvoiceCategory::Simplified).await;
        let mut outcomes = Vec::new();
        for number in 1..=5 {
            let outcome = pipeline
                .router
                .submit(&invoice(number, InvoiceCategory::Simplified, "4.60"))
                .await
                .expect("reported");
            assert_eq!(outcome.certificate_id, production.id());
            outcomes.push(outcome);
        }
        outcomes
    });

    let documents: Vec<&str> = outcomes.iter().map(|o| o.signed_xml.as_str()).collect();
    let hashes = verify_chain(&documents).expect("chain verifies");
    let expected: Vec<String> = outcomes.iter().map(|o| o.invoice_hash.clone()).collect();
    assert_eq!(hashes, expected);

    for pair in outcomes.windows(2) {
        assert_eq!(pair[1].previous_invoice_hash, pair[0].invoice_hash);
    }

    let head = pipeline
        .chain
        .head(&ChainKey::new(ORG, InvoiceCategory::Simplified));
    assert_eq!(head.counter, 5);
    assert_eq!(head.previous_invoice_hash, outcomes[4].invoice_hash);

    let last = &outcomes[4];
    let fields = qr::parse(&last.qr).expect("qr payload");
    assert_eq!(fields.invoice_hash, last.invoice_hash);
    assert_eq!(fields.total_with_vat, "4.60");
    assert_eq!(fields.vat_total, "0.60");
    assert_eq!(fields.timestamp, "2024-01-14T10:26:49Z");
    verify_stamp(&last.invoice_hash, &last.stamp).expect("stamp verifies");

    let production = pipeline.store.get(last.certificate_id).expect("certificate");
    assert_eq!(production.usage_count(), 5);
    assert_eq!(pipeline.ledger.for_certificate(last.certificate_id).len(), 5);
}

#[test]
fn rejection_leaves_chain_head_unchanged() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    mock_onboarding(&server);
    let mut rejecting = server.mock(|when, then| {
        when.method(POST).path("/invoices/reporting/single");
        then.status(400)
            .header("content-type", "application/json")
            .body(
                r#"{"validationResults": {"status": "ERROR", "errorMessages": [
                    {"type": "ERROR", "code": "invalid-invoice-hash", "category": "HASH_VALIDATION", "message": "hash mismatch", "status": "ERROR"}
                ]}, "reportingStatus": "NOT_REPORTED"}"#,
            );
    });

    let pipeline = Pipeline::new(&server);
    let rt = runtime();
    let key = ChainKey::new(ORG, InvoiceCategory::Simplified);
    rt.block_on(async {
        onboard(&pipeline, InvoiceCategory::Simplified).await;
        let err = pipeline
            .router
            .submit(&invoice(1, InvoiceCategory::Simplified, "4.60"))
            .await
            .expect_err("rejected");
        match err {
            RouterError::Gateway(GatewayError::RejectedByAuthority {
                status, validation, ..
            }) => {
                assert_eq!(status, 400);
                assert!(validation.expect("validation results").has_errors());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    });

    rejecting.assert_hits(1);
    assert_eq!(pipeline.chain.head(&key).previous_invoice_hash, GENESIS_HASH);
    assert_eq!(pipeline.chain.head(&key).counter, 0);
    assert_eq!(pipeline.audit.entries_for(AuditAction::SubmissionFailed).len(), 1);
    assert_eq!(pipeline.audit.entries_for(AuditAction::InvoiceSigned).len(), 1);

    rejecting.delete();
    server.mock(|when, then| {
        when.method(POST).path("/invoices/reporting/single");
        then.status(200)
            .header("content-type", "application/json")
            .body(REPORTED);
    });
    let outcome = rt
        .block_on(
            pipeline
                .router
                .submit(&invoice(1, InvoiceCategory::Simplified, "4.60")),
        )
        .expect("resubmitted");
    assert_eq!(outcome.previous_invoice_hash, GENESIS_HASH);
    assert_eq!(outcome.counter, 1);
}

#[test]
fn server_errors_are_retried_before_failing() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    mock_onboarding(&server);
    let unavailable = server.mock(|when, then| {
        when.method(POST).path("/invoices/clearance/single");
        then.status(503).body("unavailable");
    });

    let pipeline = Pipeline::new(&server);
    let err = runtime().block_on(async {
        onboard(&pipeline, InvoiceCategory::Standard).await;
        pipeline
            .router
            .submit(&invoice(1, InvoiceCategory::Standard, "2300.00"))
            .await
            .expect_err("exhausted")
    });

    // One initial attempt plus two retries.
    unavailable.assert_hits(3);
    match err {
        RouterError::Gateway(GatewayError::SubmissionFailed {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last_error, GatewayError::ServerError { status: 503, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let head = pipeline
        .chain
        .head(&ChainKey::new(ORG, InvoiceCategory::Standard));
    assert_eq!(head.counter, 0);
}

#[test]
fn submission_without_production_certificate_fails_before_network() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let reporting = server.mock(|when, then| {
        when.method(POST).path("/invoices/reporting/single");
        then.status(200).body(REPORTED);
    });

    let pipeline = Pipeline::new(&server);
    let err = runtime()
        .block_on(
            pipeline
                .router
                .submit(&invoice(1, InvoiceCategory::Simplified, "4.60")),
        )
        .expect_err("no certificate");
    assert!(matches!(err, RouterError::NoSigningCertificate { .. }));
    reporting.assert_hits(0);
    assert_eq!(pipeline.limiter.remaining(), pipeline.config.rate_limit.capacity);
}

#[test]
fn compliance_check_does_not_advance_chain() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    mock_onboarding(&server);
    let checks = server.mock(|when, then| {
        when.method(POST)
            .path("/compliance/invoices")
            .header_exists("authorization");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"validationResults": {"status": "PASS"}, "reportingStatus": "REPORTED", "clearanceStatus": null}"#);
    });

    let pipeline = Pipeline::new(&server);
    let sample = invoice(1, InvoiceCategory::Simplified, "4.60");
    let outcome = runtime().block_on(async {
        let (compliance, _) = onboard(&pipeline, InvoiceCategory::Simplified).await;
        let outcome = pipeline
            .router
            .check_compliance(&sample)
            .await
            .expect("compliance check");
        assert_eq!(outcome.certificate_id, compliance.id());
        outcome
    });

    checks.assert_hits(1);
    assert!(!outcome.response.validation_results().has_errors());
    let head = pipeline.chain.head(&sample.chain_key());
    assert_eq!(head.previous_invoice_hash, GENESIS_HASH);
    assert_eq!(head.counter, 0);
    assert_eq!(pipeline.audit.entries_for(AuditAction::ComplianceChecked).len(), 1);
}

#[test]
fn refusal_with_success_status_leaves_chain_head_unchanged() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    mock_onboarding(&server);
    let not_cleared = server.mock(|when, then| {
        when.method(POST).path("/invoices/clearance/single");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"validationResults": {"status": "PASS"}, "clearanceStatus": "NOT_CLEARED"}"#);
    });

    let pipeline = Pipeline::new(&server);
    let err = runtime().block_on(async {
        onboard(&pipeline, InvoiceCategory::Standard).await;
        pipeline
            .router
            .submit(&invoice(1, InvoiceCategory::Standard, "2300.00"))
            .await
            .expect_err("not cleared")
    });

    not_cleared.assert_hits(1);
    assert!(matches!(
        err,
        RouterError::Gateway(GatewayError::RejectedByAuthority { status: 200, .. })
    ));
    let head = pipeline
        .chain
        .head(&ChainKey::new(ORG, InvoiceCategory::Standard));
    assert_eq!(head.previous_invoice_hash, GENESIS_HASH);
    assert_eq!(head.counter, 0);
    assert!(pipeline.audit.entries_for(AuditAction::InvoiceCleared).is_empty());
    assert_eq!(pipeline.audit.entries_for(AuditAction::SubmissionFailed).len(), 1);
}
