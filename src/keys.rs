//! API-key issuance and validation primitives.
//!
//! A key secret looks like `esim_v1_<48 hex chars>`. The plaintext is shown
//! exactly once at creation time; only its sha256 hash is stored, so a leaked
//! database dump cannot be replayed against the gateway.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Prefix distinguishing gateway keys from every other bearer token type
/// (provider keys, admin key, OAuth access tokens).
pub const KEY_PREFIX: &str = "esim_v1_";

/// Seconds covered by the per-key rolling quota window.
pub const QUOTA_WINDOW_SECS: i64 = 3600;

/// Mint a new key secret. Returns the plaintext and its stored hash.
pub fn mint_secret() -> (String, String) {
    let mut random_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut random_bytes);
    let plaintext = format!("{}{}", KEY_PREFIX, hex::encode(random_bytes));
    let hash = hash_secret(&plaintext);
    (plaintext, hash)
}

/// One-way hash used for storage and lookup of presented secrets.
pub fn hash_secret(presented: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(presented.as_bytes());
    hex::encode(hasher.finalize())
}

/// Authenticated-caller view of a key, attached to the request after
/// validation. Never carries the hash or the secret.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialInfo {
    pub id: Uuid,
    pub label: String,
    pub hourly_quota: i64,
    pub owner_identity: Option<Uuid>,
}

/// Outcome of a rolling-window quota check.
#[derive(Debug, Clone, Copy)]
pub enum QuotaDecision {
    Allowed { used: i64, limit: i64 },
    Denied { used: i64, limit: i64, reset_at: DateTime<Utc> },
}

/// Evaluate the quota from a window count. `oldest_in_window` is the
/// timestamp of the oldest counted call, used to estimate when capacity
/// returns; absent it, the full window length is quoted.
pub fn evaluate_quota(
    used: i64,
    limit: i64,
    oldest_in_window: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> QuotaDecision {
    if used < limit {
        QuotaDecision::Allowed { used, limit }
    } else {
        let reset_at = oldest_in_window
            .map(|t| t + Duration::seconds(QUOTA_WINDOW_SECS))
            .unwrap_or_else(|| now + Duration::seconds(QUOTA_WINDOW_SECS));
        QuotaDecision::Denied {
            used,
            limit,
            reset_at: reset_at.max(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_secrets_are_prefixed_and_unique() {
        let (plain_a, hash_a) = mint_secret();
        let (plain_b, hash_b) = mint_secret();
        assert!(plain_a.starts_with(KEY_PREFIX));
        assert_eq!(plain_a.len(), KEY_PREFIX.len() + 48);
        assert_ne!(plain_a, plain_b);
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn hash_is_deterministic_and_not_the_plaintext() {
        let (plain, hash) = mint_secret();
        assert_eq!(hash_secret(&plain), hash);
        assert_ne!(hash, plain);
        // sha256 hex
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn quota_allows_below_limit_denies_at_limit() {
        let now = Utc::now();
        assert!(matches!(
            evaluate_quota(1, 2, None, now),
            QuotaDecision::Allowed { used: 1, limit: 2 }
        ));
        // The N-th accepted call brings used to N; the next check denies.
        match evaluate_quota(2, 2, Some(now - Duration::minutes(30)), now) {
            QuotaDecision::Denied { reset_at, .. } => {
                // Oldest call at now-30m resets 30m from now.
                let wait = reset_at - now;
                assert!(wait > Duration::minutes(29) && wait <= Duration::minutes(30));
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn quota_denial_without_oldest_quotes_full_window() {
        let now = Utc::now();
        match evaluate_quota(5, 2, None, now) {
            QuotaDecision::Denied { reset_at, .. } => {
                assert_eq!(reset_at, now + Duration::seconds(QUOTA_WINDOW_SECS));
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }
}
