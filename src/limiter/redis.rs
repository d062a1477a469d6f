//! Shared sliding-window limiter backed by a Redis sorted set, for
//! multi-replica deployments where the in-process window would multiply
//! the effective ceiling.
//!
//! Entries are (score = epoch millis, member = "millis:subject"). One Lua
//! script trims the expired prefix, counts, and conditionally appends, so
//! the check-then-append is atomic across replicas.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::{Admission, AdmissionControl};

const WINDOW_KEY: &str = "esimgate:admission";

pub struct SharedWindow {
    redis: ConnectionManager,
    limit: usize,
    window_secs: i64,
}

impl SharedWindow {
    pub fn new(redis: ConnectionManager, limit: usize, window_secs: i64) -> Self {
        Self {
            redis,
            limit,
            window_secs,
        }
    }
}

#[async_trait]
impl AdmissionControl for SharedWindow {
    async fn admit(&self, subject: Uuid) -> anyhow::Result<Admission> {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = self.window_secs * 1000;

        let script = redis::Script::new(
            r#"
            local cutoff = tonumber(ARGV[1]) - tonumber(ARGV[2])
            redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", cutoff)
            local count = redis.call("ZCARD", KEYS[1])
            if count < tonumber(ARGV[3]) then
                redis.call("ZADD", KEYS[1], ARGV[1], ARGV[4])
                redis.call("PEXPIRE", KEYS[1], ARGV[2])
                return {1, count + 1, 0}
            end
            local oldest = redis.call("ZRANGE", KEYS[1], 0, 0, "WITHSCORES")
            local wait = 0
            if oldest[2] then
                wait = tonumber(oldest[2]) + tonumber(ARGV[2]) - tonumber(ARGV[1])
                if wait < 0 then wait = 0 end
            end
            return {0, count, wait}
        "#,
        );

        let member = format!("{}:{}", now_ms, subject);
        let mut conn = self.redis.clone();
        let (admitted, current, wait_ms): (i64, i64, i64) = script
            .key(WINDOW_KEY)
            .arg(now_ms)
            .arg(window_ms)
            .arg(self.limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        if admitted == 1 {
            Ok(Admission::Admitted {
                current: current as usize,
                limit: self.limit,
            })
        } else {
            // Pending depth is not shared across replicas; report the head
            // of the line rather than inventing a number.
            Ok(Admission::Deferred {
                current: current as usize,
                limit: self.limit,
                wait_seconds: (wait_ms / 1000).max(0) as u64,
                queue_position: 1,
            })
        }
    }
}
