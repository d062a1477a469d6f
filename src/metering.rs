//! Usage metering: converts accepted activation calls into billable units
//! and reports them to the external ledger. Fire-and-forget from the
//! request path — the outcome is inspected only for logging.

use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::clients::billing::BillingLedger;
use crate::store::{ActivationStore, Identity, UsageStats};

/// Outcome of one report attempt. `NoBillingAccount` is a normal branch:
/// callers must not be blocked by missing billing wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Reported { event_id: String, quantity: Decimal },
    NoBillingAccount,
    Failed(String),
}

pub struct MeteringReporter {
    store: Arc<dyn ActivationStore>,
    ledger: Arc<dyn BillingLedger>,
    units_per_call: Decimal,
}

impl MeteringReporter {
    pub fn new(
        store: Arc<dyn ActivationStore>,
        ledger: Arc<dyn BillingLedger>,
        units_per_call: Decimal,
    ) -> Self {
        Self {
            store,
            ledger,
            units_per_call,
        }
    }

    /// Report `unit_count` accepted calls for `identity`. Called once per
    /// accepted call and never retried blindly: the ledger's event id is
    /// the dedupe key, and a transient send failure surfaces as `Failed`
    /// without emitting a local event row.
    pub async fn report(&self, identity: &Identity, unit_count: i64) -> ReportOutcome {
        let customer = match &identity.billing_customer_id {
            Some(c) => c.clone(),
            None => {
                tracing::debug!(identity = %identity.id, "no billing account, skipping usage report");
                return ReportOutcome::NoBillingAccount;
            }
        };

        let quantity = self.units_per_call * Decimal::from(unit_count);

        let event_id = match self.ledger.submit_usage(&customer, quantity).await {
            Ok(id) => id,
            Err(e) => return ReportOutcome::Failed(format!("ledger submission failed: {}", e)),
        };

        if let Err(e) = self
            .store
            .insert_billing_event(identity.id, &customer, unit_count, quantity, &event_id)
            .await
        {
            // The ledger accepted the event; losing the local row is an
            // audit gap, not a billing error.
            tracing::error!(ledger_event = %event_id, "failed to append billing event: {}", e);
        }

        ReportOutcome::Reported { event_id, quantity }
    }

    /// Read-only aggregate for display. No side effects.
    pub async fn usage_stats(
        &self,
        identity_id: Uuid,
        window_days: i64,
    ) -> anyhow::Result<UsageStats> {
        self.store.usage_stats(identity_id, window_days).await
    }
}
