//! In-process sliding-window limiter for single-instance deployments.
//!
//! With N replicas the effective global ceiling becomes N × limit; run the
//! Redis backend instead when scaling out.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Admission, AdmissionControl};

struct WindowState {
    /// Time-ordered by construction: entries are only ever pushed "now",
    /// so eviction is a prefix trim.
    entries: VecDeque<(DateTime<Utc>, Uuid)>,
    /// Deferrals since the last successful admit. Feeds the queue-position
    /// estimate relayed to waiting callers; reset whenever capacity frees up.
    pending: usize,
}

pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window_secs: i64) -> Self {
        Self {
            limit,
            window: Duration::seconds(window_secs),
            state: Mutex::new(WindowState {
                entries: VecDeque::new(),
                pending: 0,
            }),
        }
    }

    /// Check admission at an explicit instant. All state mutation happens
    /// under the lock; cost is O(evicted) per call, bounded by the ceiling.
    pub async fn admit_at(&self, subject: Uuid, now: DateTime<Utc>) -> Admission {
        let mut state = self.state.lock().await;

        let cutoff = now - self.window;
        while matches!(state.entries.front(), Some((t, _)) if *t <= cutoff) {
            state.entries.pop_front();
        }

        let current = state.entries.len();
        if current < self.limit {
            state.entries.push_back((now, subject));
            state.pending = 0;
            return Admission::Admitted {
                current: current + 1,
                limit: self.limit,
            };
        }

        // Full. The oldest entry leaving the window is the next capacity.
        let wait_seconds = state
            .entries
            .front()
            .map(|(t, _)| (*t + self.window - now).num_seconds().max(0) as u64)
            .unwrap_or(0);
        state.pending += 1;
        Admission::Deferred {
            current,
            limit: self.limit,
            wait_seconds,
            queue_position: state.pending,
        }
    }
}

#[async_trait]
impl AdmissionControl for SlidingWindow {
    async fn admit(&self, subject: Uuid) -> anyhow::Result<Admission> {
        Ok(self.admit_at(subject, Utc::now()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_until_ceiling() {
        let limiter = SlidingWindow::new(3, 3600);
        let now = Utc::now();
        for i in 1..=3 {
            let a = limiter.admit_at(Uuid::new_v4(), now).await;
            assert_eq!(
                a,
                Admission::Admitted {
                    current: i,
                    limit: 3
                }
            );
        }
        match limiter.admit_at(Uuid::new_v4(), now).await {
            Admission::Deferred {
                current,
                wait_seconds,
                queue_position,
                ..
            } => {
                assert_eq!(current, 3);
                assert_eq!(wait_seconds, 3600);
                assert_eq!(queue_position, 1);
            }
            other => panic!("expected deferral, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn capacity_returns_when_oldest_ages_out() {
        let limiter = SlidingWindow::new(2, 3600);
        let start = Utc::now();
        limiter.admit_at(Uuid::new_v4(), start).await;
        limiter
            .admit_at(Uuid::new_v4(), start + Duration::minutes(10))
            .await;

        // Still inside the window: deferred, ETA points at the oldest entry.
        let just_before = start + Duration::seconds(3599);
        match limiter.admit_at(Uuid::new_v4(), just_before).await {
            Admission::Deferred { wait_seconds, .. } => assert_eq!(wait_seconds, 1),
            other => panic!("expected deferral, got {:?}", other),
        }

        // One second later the oldest entry has aged out.
        let after = start + Duration::seconds(3601);
        assert!(matches!(
            limiter.admit_at(Uuid::new_v4(), after).await,
            Admission::Admitted { .. }
        ));
    }

    #[tokio::test]
    async fn queue_position_grows_per_deferral_and_resets_on_admit() {
        let limiter = SlidingWindow::new(1, 3600);
        let start = Utc::now();
        limiter.admit_at(Uuid::new_v4(), start).await;

        let positions: Vec<usize> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                if let Admission::Deferred { queue_position, .. } =
                    limiter.admit_at(Uuid::new_v4(), start).await
                {
                    out.push(queue_position);
                }
            }
            out
        };
        assert_eq!(positions, vec![1, 2, 3]);

        let later = start + Duration::seconds(3601);
        assert!(matches!(
            limiter.admit_at(Uuid::new_v4(), later).await,
            Admission::Admitted { .. }
        ));
        if let Admission::Deferred { queue_position, .. } =
            limiter.admit_at(Uuid::new_v4(), later).await
        {
            assert_eq!(queue_position, 1);
        } else {
            panic!("expected deferral after refill");
        }
    }
}
