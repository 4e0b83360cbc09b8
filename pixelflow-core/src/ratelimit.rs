//! Token-bucket rate limiting shared across API replicas.
//!
//! A single atomic Lua script holds the bucket state in Redis so every
//! replica observes the same counters.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

use crate::domain::DEFAULT_USER_ID;
use crate::error::{PixelflowError, Result};

const DEFAULT_KEY_PREFIX: &str = "pixelflow:api:ratelimit";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: i64,
    pub retry_after: Duration,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, subject: &str) -> Result<Decision>;
}

fn token_bucket_script() -> Script {
    Script::new(
        r#"
        local key = KEYS[1]
        local capacity = tonumber(ARGV[1])
        local refill_per_ms = tonumber(ARGV[2])
        local now_ms = tonumber(ARGV[3])
        local requested = tonumber(ARGV[4])
        local ttl_ms = tonumber(ARGV[5])

        local data = redis.call("HMGET", key, "tokens", "timestamp")
        local tokens = tonumber(data[1])
        local timestamp = tonumber(data[2])

        if tokens == nil then
          tokens = capacity
        end
        if timestamp == nil then
          timestamp = now_ms
        end

        local elapsed = math.max(0, now_ms - timestamp)
        tokens = math.min(capacity, tokens + (elapsed * refill_per_ms))

        local allowed = 0
        local retry_after_ms = 0
        if tokens >= requested then
          tokens = tokens - requested
          allowed = 1
        else
          retry_after_ms = math.ceil((requested - tokens) / refill_per_ms)
        end

        redis.call("HMSET", key, "tokens", tokens, "timestamp", now_ms)
        redis.call("PEXPIRE", key, ttl_ms)

        return {allowed, math.floor(tokens), retry_after_ms}
        "#,
    )
}

/// Shared token bucket: `capacity` tokens refilled over `window`, one token
/// consumed per request. Missing state initializes to a full bucket.
pub struct RedisTokenBucket {
    conn: ConnectionManager,
    capacity: i64,
    refill_per_ms: f64,
    ttl: Duration,
    key_prefix: String,
}

impl RedisTokenBucket {
    pub async fn connect(redis_url: &str, capacity: u32, window: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(PixelflowError::Internal(
                "rate limit capacity must be positive".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(PixelflowError::Internal(
                "rate limit window must be positive".to_string(),
            ));
        }

        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        let window_ms = window.as_millis().max(1) as f64;
        Ok(Self {
            conn,
            capacity: capacity as i64,
            refill_per_ms: capacity as f64 / window_ms,
            ttl: window * 2,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimiter for RedisTokenBucket {
    async fn allow(&self, subject: &str) -> Result<Decision> {
        let subject = subject.trim();
        let subject = if subject.is_empty() {
            DEFAULT_USER_ID
        } else {
            subject
        };

        let key = format!("{}:{subject}", self.key_prefix);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut conn = self.conn.clone();
        let values: Vec<i64> = token_bucket_script()
            .key(key)
            .arg(self.capacity)
            .arg(self.refill_per_ms)
            .arg(now_ms)
            .arg(1)
            .arg(self.ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        if values.len() != 3 {
            return Err(PixelflowError::Internal(
                "invalid token bucket response".to_string(),
            ));
        }

        Ok(Decision {
            allowed: values[0] == 1,
            remaining: values[1],
            retry_after: Duration::from_millis(values[2].max(0) as u64),
        })
    }
}
