//! Global admission control over the scarce provisioning API.
//!
//! Unlike per-key quotas, this limiter is shared across all keys and users:
//! it protects the downstream eSIM provider regardless of who is calling.
//! An admission check never blocks — deferred callers get an ETA to relay
//! to the human and are expected to re-invoke later.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        current: usize,
        limit: usize,
    },
    Deferred {
        current: usize,
        limit: usize,
        wait_seconds: u64,
        queue_position: usize,
    },
}

#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Try to admit one provisioning call for `subject` into the current
    /// rolling window.
    async fn admit(&self, subject: Uuid) -> anyhow::Result<Admission>;
}
