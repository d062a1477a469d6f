//! The activation orchestrator.
//!
//! Each AI "turn" is a stateless RPC call that must reconstruct where the
//! user is in the multi-step real-world flow, so the machine is re-entered
//! from the top on every invocation and each state either short-circuits
//! (already served, unpaid, deferred) or advances. External side effects
//! must never duplicate: the active-eSIM check plus the store's unique
//! constraints make re-invocation safe.
//!
//! States: ResolveIdentity → CheckActiveEsim → CheckEntitlement →
//! (IssueInvoice | CheckAdmission) → Provision → Notify → Done, with error
//! exits from every state.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::clients::billing::BillingLedger;
use crate::clients::notify::{ActivationNotifier, NotifyOutcome};
use crate::clients::provisioner::Provisioner;
use crate::limiter::{Admission, AdmissionControl};
use crate::store::{ActivationStore, Esim, Identity};

/// Arguments of the `activate_esim` tool call.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ToolArgs {
    pub email: String,
    #[serde(rename = "externalAuthId")]
    pub external_auth_id: String,
}

/// Every terminal outcome of one orchestrator run. AI agents relay these
/// statuses verbatim to the human and re-invoke later; the orchestrator
/// performs no polling or background retry.
#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    Activated {
        esim: Esim,
    },
    InvoiceSent {
        invoice_url: String,
        amount_due: Decimal,
    },
    RateLimited {
        wait_seconds: u64,
        queue_position: usize,
    },
    NotFound,
    Error {
        reason: String,
    },
}

impl ActivationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActivationOutcome::Activated { .. })
    }

    /// Wire shape relayed to the calling agent.
    pub fn to_json(&self) -> Value {
        match self {
            ActivationOutcome::Activated { esim } => json!({
                "success": true,
                "details": {
                    "resourceId": esim.id,
                    "iccid": esim.iccid,
                    "msisdn": esim.msisdn,
                    "activationCode": esim.activation_code,
                    "status": esim.status,
                }
            }),
            ActivationOutcome::InvoiceSent {
                invoice_url,
                amount_due,
            } => json!({
                "success": false,
                "status": "invoice_sent",
                "invoiceUrl": invoice_url,
                "amountDue": amount_due,
            }),
            ActivationOutcome::RateLimited {
                wait_seconds,
                queue_position,
            } => json!({
                "success": false,
                "status": "rate_limited",
                "waitSeconds": wait_seconds,
                "queuePosition": queue_position,
            }),
            ActivationOutcome::NotFound => json!({
                "success": false,
                "status": "not_found",
            }),
            ActivationOutcome::Error { reason } => json!({
                "success": false,
                "status": "error",
                "reason": reason,
            }),
        }
    }
}

/// Result of one run: the terminal outcome plus the identity it resolved,
/// which upstream code needs for usage metering.
#[derive(Debug)]
pub struct ActivationRun {
    pub outcome: ActivationOutcome,
    pub identity: Option<Identity>,
}

enum Step {
    ResolveIdentity,
    CheckActiveEsim(Identity),
    CheckEntitlement(Identity),
    IssueInvoice(Identity),
    CheckAdmission(Identity),
    Provision(Identity),
    Notify(Identity, Esim),
}

impl Step {
    fn identity(&self) -> Option<&Identity> {
        match self {
            Step::ResolveIdentity => None,
            Step::CheckActiveEsim(id)
            | Step::CheckEntitlement(id)
            | Step::IssueInvoice(id)
            | Step::CheckAdmission(id)
            | Step::Provision(id)
            | Step::Notify(id, _) => Some(id),
        }
    }
}

enum Transition {
    Next(Step),
    Done(ActivationOutcome),
}

pub struct Orchestrator {
    store: Arc<dyn ActivationStore>,
    provisioner: Arc<dyn Provisioner>,
    ledger: Arc<dyn BillingLedger>,
    notifier: Arc<dyn ActivationNotifier>,
    limiter: Arc<dyn AdmissionControl>,
    product_id: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ActivationStore>,
        provisioner: Arc<dyn Provisioner>,
        ledger: Arc<dyn BillingLedger>,
        notifier: Arc<dyn ActivationNotifier>,
        limiter: Arc<dyn AdmissionControl>,
        product_id: String,
    ) -> Self {
        Self {
            store,
            provisioner,
            ledger,
            notifier,
            limiter,
            product_id,
        }
    }

    pub async fn activate(&self, args: &ToolArgs) -> ActivationRun {
        let mut step = Step::ResolveIdentity;
        let mut identity = None;
        loop {
            match self.transition(step, args).await {
                Transition::Next(next) => {
                    if let Some(id) = next.identity() {
                        identity = Some(id.clone());
                    }
                    step = next;
                }
                Transition::Done(outcome) => {
                    return ActivationRun { outcome, identity };
                }
            }
        }
    }

    async fn transition(&self, step: Step, args: &ToolArgs) -> Transition {
        match step {
            Step::ResolveIdentity => self.resolve_identity(args).await,
            Step::CheckActiveEsim(identity) => self.check_active_esim(identity).await,
            Step::CheckEntitlement(identity) => self.check_entitlement(identity).await,
            Step::IssueInvoice(identity) => self.issue_invoice(identity).await,
            Step::CheckAdmission(identity) => self.check_admission(identity).await,
            Step::Provision(identity) => self.provision(identity).await,
            Step::Notify(identity, esim) => self.notify(identity, esim).await,
        }
    }

    /// Auto-registration path: unknown externalAuthIds get an identity
    /// created for them. An existing identity whose email does not match
    /// the caller's claim is a lookup mismatch, not an update.
    async fn resolve_identity(&self, args: &ToolArgs) -> Transition {
        let identity = match self
            .store
            .find_or_create_identity(&args.external_auth_id, &args.email)
            .await
        {
            Ok(identity) => identity,
            Err(e) => return storage_error("identity lookup", e),
        };

        if !identity.email.eq_ignore_ascii_case(&args.email) {
            tracing::warn!(
                external_auth_id = %args.external_auth_id,
                "activation email does not match registered identity"
            );
            return Transition::Done(ActivationOutcome::NotFound);
        }

        Transition::Next(Step::CheckActiveEsim(identity))
    }

    /// Idempotent re-invocation: an already-served user gets their existing
    /// eSIM back, with no second provisioning call and no second charge.
    async fn check_active_esim(&self, identity: Identity) -> Transition {
        match self.store.active_esim(identity.id).await {
            Ok(Some(esim)) => {
                tracing::debug!(identity = %identity.id, iccid = %esim.iccid, "active eSIM already provisioned");
                Transition::Done(ActivationOutcome::Activated { esim })
            }
            Ok(None) => Transition::Next(Step::CheckEntitlement(identity)),
            Err(e) => storage_error("active-eSIM lookup", e),
        }
    }

    /// Missing payment is a normal branch, not an error.
    async fn check_entitlement(&self, identity: Identity) -> Transition {
        match self
            .store
            .paid_entitlement(identity.id, &self.product_id)
            .await
        {
            Ok(Some(_)) => Transition::Next(Step::CheckAdmission(identity)),
            Ok(None) => Transition::Next(Step::IssueInvoice(identity)),
            Err(e) => storage_error("entitlement lookup", e),
        }
    }

    /// Reuse an open invoice if one exists; the caller must re-invoke after
    /// payment, so this run's work ends here either way.
    async fn issue_invoice(&self, identity: Identity) -> Transition {
        match self.store.open_invoice(identity.id, &self.product_id).await {
            Ok(Some(invoice)) => {
                return Transition::Done(ActivationOutcome::InvoiceSent {
                    invoice_url: invoice.invoice_url,
                    amount_due: invoice.amount_due,
                });
            }
            Ok(None) => {}
            Err(e) => return storage_error("invoice lookup", e),
        }

        let draft = match self
            .ledger
            .create_invoice(
                identity.billing_customer_id.as_deref(),
                &identity.email,
                &self.product_id,
            )
            .await
        {
            Ok(draft) => draft,
            Err(e) => {
                tracing::error!("invoice creation failed: {}", e);
                return Transition::Done(ActivationOutcome::Error {
                    reason: "could not issue an invoice; please try again".into(),
                });
            }
        };

        if let Err(e) = self
            .store
            .record_invoice(
                identity.id,
                &self.product_id,
                &draft.invoice_url,
                draft.amount_due,
            )
            .await
        {
            return storage_error("invoice record", e);
        }

        Transition::Done(ActivationOutcome::InvoiceSent {
            invoice_url: draft.invoice_url,
            amount_due: draft.amount_due,
        })
    }

    /// Global admission over the scarce provisioning API. Deferred callers
    /// get an ETA and retry later; nothing is consumed.
    async fn check_admission(&self, identity: Identity) -> Transition {
        match self.limiter.admit(identity.id).await {
            Ok(Admission::Admitted { current, limit }) => {
                tracing::debug!(current, limit, "admission granted");
                Transition::Next(Step::Provision(identity))
            }
            Ok(Admission::Deferred {
                current,
                limit,
                wait_seconds,
                queue_position,
            }) => {
                tracing::info!(current, limit, wait_seconds, "admission deferred");
                Transition::Done(ActivationOutcome::RateLimited {
                    wait_seconds,
                    queue_position,
                })
            }
            Err(e) => storage_error("admission check", e),
        }
    }

    /// Provisioning success is durably recorded before Notify, so a later
    /// failure can never lose the allocated resource.
    async fn provision(&self, identity: Identity) -> Transition {
        let allocated = match self
            .provisioner
            .provision(&identity.email, &self.product_id)
            .await
        {
            Ok(allocated) => allocated,
            Err(e) => {
                tracing::error!(identity = %identity.id, "provisioning failed: {}", e);
                return Transition::Done(ActivationOutcome::Error {
                    reason: "eSIM provisioning failed; the request can be retried".into(),
                });
            }
        };

        match self.store.record_esim(identity.id, &allocated).await {
            Ok(esim) => Transition::Next(Step::Notify(identity, esim)),
            Err(e) => storage_error("eSIM record", e),
        }
    }

    /// Best-effort delivery. Failure is logged, never propagated.
    async fn notify(&self, identity: Identity, esim: Esim) -> Transition {
        match self.notifier.send_activation(&identity.email, &esim).await {
            NotifyOutcome::Sent | NotifyOutcome::Skipped => {}
            NotifyOutcome::Failed(reason) => {
                tracing::warn!(identity = %identity.id, "activation notification failed: {}", reason);
            }
        }
        Transition::Done(ActivationOutcome::Activated { esim })
    }
}

fn storage_error(context: &str, e: anyhow::Error) -> Transition {
    tracing::error!("{} failed: {}", context, e);
    Transition::Done(ActivationOutcome::Error {
        reason: "a backend dependency is unavailable; please try again".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_esim() -> Esim {
        Esim {
            id: Uuid::new_v4(),
            identity_id: Uuid::new_v4(),
            iccid: "8944500512345678903".into(),
            msisdn: Some("+14155550123".into()),
            activation_code: "LPA:1$smdp.example.com$ABC-123".into(),
            status: "active".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn activated_outcome_serializes_details() {
        let esim = sample_esim();
        let json = ActivationOutcome::Activated { esim: esim.clone() }.to_json();
        assert_eq!(json["success"], true);
        assert_eq!(json["details"]["iccid"], esim.iccid);
        assert_eq!(json["details"]["activationCode"], esim.activation_code);
    }

    #[test]
    fn invoice_outcome_uses_wire_keys() {
        let json = ActivationOutcome::InvoiceSent {
            invoice_url: "https://pay.example.com/inv_1".into(),
            amount_due: Decimal::new(2999, 2),
        }
        .to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["status"], "invoice_sent");
        assert_eq!(json["invoiceUrl"], "https://pay.example.com/inv_1");
        assert_eq!(json["amountDue"], "29.99");
    }

    #[test]
    fn rate_limited_outcome_carries_eta() {
        let json = ActivationOutcome::RateLimited {
            wait_seconds: 840,
            queue_position: 3,
        }
        .to_json();
        assert_eq!(json["status"], "rate_limited");
        assert_eq!(json["waitSeconds"], 840);
        assert_eq!(json["queuePosition"], 3);
    }

    #[test]
    fn only_activated_is_success() {
        assert!(ActivationOutcome::Activated { esim: sample_esim() }.is_success());
        assert!(!ActivationOutcome::NotFound.is_success());
        assert!(!ActivationOutcome::Error { reason: "x".into() }.is_success());
    }

    #[test]
    fn tool_args_accept_camel_case() {
        let args: ToolArgs = serde_json::from_value(serde_json::json!({
            "email": "user@example.com",
            "externalAuthId": "auth0|abc123"
        }))
        .unwrap();
        assert_eq!(args.external_auth_id, "auth0|abc123");
    }
}
