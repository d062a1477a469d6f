//! Orchestrator and metering behavior against in-memory collaborators.
//!
//! These tests verify:
//! 1. The no-payment path always ends in `invoice_sent` and never provisions
//! 2. Idempotent re-invocation returns the existing eSIM without a second
//!    provisioning call
//! 3. Deferred admission surfaces a wait estimate and consumes nothing
//! 4. Concurrent auto-registration converges on a single identity
//! 5. Notification failure never rolls back an activation
//! 6. Metering skips identities without billing accounts and keys events
//!    by the ledger's id

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use esimgate::activation::{ActivationOutcome, Orchestrator, ToolArgs};
use esimgate::clients::billing::{BillingLedger, InvoiceDraft};
use esimgate::clients::notify::{ActivationNotifier, NotifyOutcome};
use esimgate::clients::provisioner::{ProvisionError, Provisioner};
use esimgate::limiter::memory::SlidingWindow;
use esimgate::metering::{MeteringReporter, ReportOutcome};
use esimgate::store::{
    ActivationStore, Entitlement, Esim, Identity, Invoice, NewEsim, UsageStats,
};

const PRODUCT: &str = "global-esim";

// ── In-memory collaborators ──────────────────────────────────

#[derive(Default)]
struct MemStore {
    identities: Mutex<Vec<Identity>>,
    esims: Mutex<Vec<Esim>>,
    entitlements: Mutex<Vec<Entitlement>>,
    invoices: Mutex<Vec<Invoice>>,
    billing_events: Mutex<Vec<(Uuid, i64, Decimal, String)>>,
}

impl MemStore {
    async fn seed_identity(&self, email: &str, auth_id: &str, customer: Option<&str>) -> Identity {
        let identity = Identity {
            id: Uuid::new_v4(),
            external_auth_id: auth_id.into(),
            email: email.into(),
            billing_customer_id: customer.map(String::from),
            created_at: Utc::now(),
        };
        self.identities.lock().await.push(identity.clone());
        identity
    }

    async fn seed_entitlement(&self, identity_id: Uuid) {
        self.entitlements.lock().await.push(Entitlement {
            id: Uuid::new_v4(),
            identity_id,
            product_id: PRODUCT.into(),
            status: "paid".into(),
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl ActivationStore for MemStore {
    async fn find_or_create_identity(
        &self,
        external_auth_id: &str,
        email: &str,
    ) -> anyhow::Result<Identity> {
        // Single lock plays the role of the unique constraint: concurrent
        // calls converge on the first inserted row.
        let mut identities = self.identities.lock().await;
        if let Some(existing) = identities
            .iter()
            .find(|i| i.external_auth_id == external_auth_id)
        {
            return Ok(existing.clone());
        }
        let identity = Identity {
            id: Uuid::new_v4(),
            external_auth_id: external_auth_id.into(),
            email: email.into(),
            billing_customer_id: None,
            created_at: Utc::now(),
        };
        identities.push(identity.clone());
        Ok(identity)
    }

    async fn active_esim(&self, identity_id: Uuid) -> anyhow::Result<Option<Esim>> {
        Ok(self
            .esims
            .lock()
            .await
            .iter()
            .find(|e| e.identity_id == identity_id && e.status == "active")
            .cloned())
    }

    async fn paid_entitlement(
        &self,
        identity_id: Uuid,
        product_id: &str,
    ) -> anyhow::Result<Option<Entitlement>> {
        Ok(self
            .entitlements
            .lock()
            .await
            .iter()
            .find(|e| e.identity_id == identity_id && e.product_id == product_id)
            .cloned())
    }

    async fn open_invoice(
        &self,
        identity_id: Uuid,
        product_id: &str,
    ) -> anyhow::Result<Option<Invoice>> {
        Ok(self
            .invoices
            .lock()
            .await
            .iter()
            .find(|i| {
                i.identity_id == identity_id && i.product_id == product_id && i.status == "open"
            })
            .cloned())
    }

    async fn record_invoice(
        &self,
        identity_id: Uuid,
        product_id: &str,
        invoice_url: &str,
        amount_due: Decimal,
    ) -> anyhow::Result<Invoice> {
        let invoice = Invoice {
            id: Uuid::new_v4(),
            identity_id,
            product_id: product_id.into(),
            invoice_url: invoice_url.into(),
            amount_due,
            status: "open".into(),
            created_at: Utc::now(),
        };
        self.invoices.lock().await.push(invoice.clone());
        Ok(invoice)
    }

    async fn record_esim(&self, identity_id: Uuid, esim: &NewEsim) -> anyhow::Result<Esim> {
        let mut esims = self.esims.lock().await;
        // Partial-unique-index semantics: a concurrent winner's row is
        // returned instead of inserting a duplicate.
        if let Some(existing) = esims
            .iter()
            .find(|e| e.identity_id == identity_id && e.status == "active")
        {
            return Ok(existing.clone());
        }
        let row = Esim {
            id: Uuid::new_v4(),
            identity_id,
            iccid: esim.iccid.clone(),
            msisdn: esim.msisdn.clone(),
            activation_code: esim.activation_code.clone(),
            status: "active".into(),
            created_at: Utc::now(),
        };
        esims.push(row.clone());
        Ok(row)
    }

    async fn insert_billing_event(
        &self,
        identity_id: Uuid,
        _billing_customer_id: &str,
        unit_count: i64,
        billable_quantity: Decimal,
        ledger_event_id: &str,
    ) -> anyhow::Result<()> {
        self.billing_events.lock().await.push((
            identity_id,
            unit_count,
            billable_quantity,
            ledger_event_id.into(),
        ));
        Ok(())
    }

    async fn usage_stats(&self, identity_id: Uuid, _window_days: i64) -> anyhow::Result<UsageStats> {
        let events = self.billing_events.lock().await;
        let mine = events.iter().filter(|(id, ..)| *id == identity_id);
        Ok(UsageStats {
            calls: mine.clone().map(|(_, n, ..)| n).sum(),
            billable_quantity: mine.map(|(_, _, q, _)| q).sum(),
        })
    }
}

#[derive(Default)]
struct MockProvisioner {
    calls: AtomicUsize,
    fail: AtomicBool,
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(&self, _email: &str, _product_id: &str) -> Result<NewEsim, ProvisionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProvisionError::Rejected {
                status: 503,
                body: "inventory exhausted".into(),
            });
        }
        Ok(NewEsim {
            iccid: format!("894450051234567890{}", n),
            msisdn: None,
            activation_code: "LPA:1$smdp.example.com$TEST".into(),
        })
    }
}

#[derive(Default)]
struct MockLedger {
    invoices_created: AtomicUsize,
    usage_events: AtomicUsize,
    fail_usage: AtomicBool,
}

#[async_trait]
impl BillingLedger for MockLedger {
    async fn create_invoice(
        &self,
        _billing_customer_id: Option<&str>,
        _email: &str,
        _product_id: &str,
    ) -> anyhow::Result<InvoiceDraft> {
        let n = self.invoices_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(InvoiceDraft {
            invoice_url: format!("https://pay.example.com/inv_{}", n),
            amount_due: Decimal::new(2999, 2),
        })
    }

    async fn submit_usage(
        &self,
        _billing_customer_id: &str,
        _quantity: Decimal,
    ) -> anyhow::Result<String> {
        if self.fail_usage.load(Ordering::SeqCst) {
            anyhow::bail!("ledger is down");
        }
        let n = self.usage_events.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("evt_{}", n))
    }
}

struct MockNotifier {
    fail: bool,
}

#[async_trait]
impl ActivationNotifier for MockNotifier {
    async fn send_activation(&self, _email: &str, _esim: &Esim) -> NotifyOutcome {
        if self.fail {
            NotifyOutcome::Failed("relay unreachable".into())
        } else {
            NotifyOutcome::Sent
        }
    }
}

struct Harness {
    store: Arc<MemStore>,
    provisioner: Arc<MockProvisioner>,
    ledger: Arc<MockLedger>,
    orchestrator: Orchestrator,
}

fn harness_with(limit: usize, notify_fails: bool) -> Harness {
    let store = Arc::new(MemStore::default());
    let provisioner = Arc::new(MockProvisioner::default());
    let ledger = Arc::new(MockLedger::default());
    let orchestrator = Orchestrator::new(
        store.clone(),
        provisioner.clone(),
        ledger.clone(),
        Arc::new(MockNotifier { fail: notify_fails }),
        Arc::new(SlidingWindow::new(limit, 3600)),
        PRODUCT.into(),
    );
    Harness {
        store,
        provisioner,
        ledger,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(100, false)
}

fn args(email: &str, auth_id: &str) -> ToolArgs {
    serde_json::from_value(serde_json::json!({
        "email": email,
        "externalAuthId": auth_id,
    }))
    .unwrap()
}

// ── Orchestrator tests ───────────────────────────────────────

#[tokio::test]
async fn unpaid_identity_gets_invoice_and_no_provisioning() {
    let h = harness();
    let run = h.orchestrator.activate(&args("ada@example.com", "auth0|ada")).await;

    match &run.outcome {
        ActivationOutcome::InvoiceSent {
            invoice_url,
            amount_due,
        } => {
            assert!(invoice_url.starts_with("https://pay.example.com/"));
            assert_eq!(*amount_due, Decimal::new(2999, 2));
        }
        other => panic!("expected invoice_sent, got {:?}", other),
    }
    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 0);

    // A second call reuses the open invoice instead of issuing another.
    let rerun = h.orchestrator.activate(&args("ada@example.com", "auth0|ada")).await;
    assert!(matches!(rerun.outcome, ActivationOutcome::InvoiceSent { .. }));
    assert_eq!(h.ledger.invoices_created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn paid_identity_provisions_once_then_short_circuits() {
    let h = harness();
    let identity = h
        .store
        .seed_identity("bob@example.com", "auth0|bob", Some("cus_bob"))
        .await;
    h.store.seed_entitlement(identity.id).await;

    let first = h.orchestrator.activate(&args("bob@example.com", "auth0|bob")).await;
    let first_esim = match first.outcome {
        ActivationOutcome::Activated { esim } => esim,
        other => panic!("expected activation, got {:?}", other),
    };
    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 1);

    // Re-asking an already-served user must not re-provision or re-charge.
    let second = h.orchestrator.activate(&args("bob@example.com", "auth0|bob")).await;
    match second.outcome {
        ActivationOutcome::Activated { esim } => {
            assert_eq!(esim.id, first_esim.id);
            assert_eq!(esim.iccid, first_esim.iccid);
        }
        other => panic!("expected activation, got {:?}", other),
    }
    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deferred_admission_returns_rate_limited_and_consumes_nothing() {
    let h = harness_with(1, false);
    let occupant = h
        .store
        .seed_identity("early@example.com", "auth0|early", None)
        .await;
    h.store.seed_entitlement(occupant.id).await;
    // Fill the single admission slot.
    let run = h
        .orchestrator
        .activate(&args("early@example.com", "auth0|early"))
        .await;
    assert!(run.outcome.is_success());

    let late = h
        .store
        .seed_identity("late@example.com", "auth0|late", None)
        .await;
    h.store.seed_entitlement(late.id).await;
    let deferred = h
        .orchestrator
        .activate(&args("late@example.com", "auth0|late"))
        .await;

    match deferred.outcome {
        ActivationOutcome::RateLimited {
            wait_seconds,
            queue_position,
        } => {
            assert!(wait_seconds > 0);
            assert_eq!(queue_position, 1);
        }
        other => panic!("expected rate_limited, got {:?}", other),
    }
    // The deferred caller must not have provisioned anything.
    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 1);
    assert!(h.store.active_esim(late.id).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_auto_registration_converges_on_one_identity() {
    let h = harness();
    let shared = args("new@example.com", "auth0|new");
    let a = h.orchestrator.activate(&shared);
    let b = h.orchestrator.activate(&shared);
    let (run_a, run_b) = tokio::join!(a, b);

    assert!(matches!(run_a.outcome, ActivationOutcome::InvoiceSent { .. }));
    assert!(matches!(run_b.outcome, ActivationOutcome::InvoiceSent { .. }));

    let identities = h.store.identities.lock().await;
    assert_eq!(identities.len(), 1);
    assert_eq!(run_a.identity.unwrap().id, run_b.identity.unwrap().id);
}

#[tokio::test]
async fn email_mismatch_is_not_found() {
    let h = harness();
    h.store
        .seed_identity("real@example.com", "auth0|carol", None)
        .await;

    let run = h
        .orchestrator
        .activate(&args("impostor@example.com", "auth0|carol"))
        .await;
    assert!(matches!(run.outcome, ActivationOutcome::NotFound));
}

#[tokio::test]
async fn notification_failure_does_not_roll_back_activation() {
    let h = harness_with(100, true);
    let identity = h
        .store
        .seed_identity("dana@example.com", "auth0|dana", None)
        .await;
    h.store.seed_entitlement(identity.id).await;

    let run = h.orchestrator.activate(&args("dana@example.com", "auth0|dana")).await;
    assert!(run.outcome.is_success());
    assert!(h.store.active_esim(identity.id).await.unwrap().is_some());
}

#[tokio::test]
async fn provisioning_failure_is_a_retryable_error() {
    let h = harness();
    let identity = h
        .store
        .seed_identity("eve@example.com", "auth0|eve", None)
        .await;
    h.store.seed_entitlement(identity.id).await;
    h.provisioner.fail.store(true, Ordering::SeqCst);

    let run = h.orchestrator.activate(&args("eve@example.com", "auth0|eve")).await;
    assert!(matches!(run.outcome, ActivationOutcome::Error { .. }));
    assert!(h.store.active_esim(identity.id).await.unwrap().is_none());

    // Caller-driven retry: the next invocation succeeds once the provider
    // recovers, entering through the same states.
    h.provisioner.fail.store(false, Ordering::SeqCst);
    let retry = h.orchestrator.activate(&args("eve@example.com", "auth0|eve")).await;
    assert!(retry.outcome.is_success());
}

// ── Metering tests ───────────────────────────────────────────

#[tokio::test]
async fn metering_without_billing_account_is_nonfatal() {
    let store = Arc::new(MemStore::default());
    let ledger = Arc::new(MockLedger::default());
    let reporter = MeteringReporter::new(store.clone(), ledger.clone(), Decimal::ONE);

    let identity = store.seed_identity("free@example.com", "auth0|free", None).await;
    let outcome = reporter.report(&identity, 1).await;

    assert_eq!(outcome, ReportOutcome::NoBillingAccount);
    assert_eq!(ledger.usage_events.load(Ordering::SeqCst), 0);
    assert!(store.billing_events.lock().await.is_empty());
}

#[tokio::test]
async fn metering_appends_event_keyed_by_ledger_id() {
    let store = Arc::new(MemStore::default());
    let ledger = Arc::new(MockLedger::default());
    let reporter = MeteringReporter::new(store.clone(), ledger.clone(), Decimal::new(5, 1));

    let identity = store
        .seed_identity("paid@example.com", "auth0|paid", Some("cus_paid"))
        .await;
    let outcome = reporter.report(&identity, 4).await;

    match outcome {
        ReportOutcome::Reported { event_id, quantity } => {
            assert_eq!(event_id, "evt_1");
            assert_eq!(quantity, Decimal::new(2, 0)); // 4 calls × 0.5 units
        }
        other => panic!("expected report, got {:?}", other),
    }

    let events = store.billing_events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].3, "evt_1");

    drop(events);
    let stats = reporter.usage_stats(identity.id, 30).await.unwrap();
    assert_eq!(stats.calls, 4);
}

#[tokio::test]
async fn metering_send_failure_emits_no_local_event() {
    let store = Arc::new(MemStore::default());
    let ledger = Arc::new(MockLedger::default());
    ledger.fail_usage.store(true, Ordering::SeqCst);
    let reporter = MeteringReporter::new(store.clone(), ledger.clone(), Decimal::ONE);

    let identity = store
        .seed_identity("down@example.com", "auth0|down", Some("cus_down"))
        .await;
    let outcome = reporter.report(&identity, 1).await;

    assert!(matches!(outcome, ReportOutcome::Failed(_)));
    assert!(store.billing_events.lock().await.is_empty());
}
