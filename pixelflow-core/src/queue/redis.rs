use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction, Script};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::queue::{
    retry_backoff, Enqueuer, ProcessImagePayload, TaskDisposition, TaskEnvelope, TaskInfo,
    DEFAULT_MAX_RETRY, DEFAULT_TASK_TIMEOUT, TASK_TYPE_PROCESS_IMAGE,
};

const KEY_PREFIX: &str = "pixelflow:queue";

/// Blocking-pop wait per poll, so cancellation is observed promptly.
const POLL_WAIT_SECS: f64 = 1.0;

/// Atomically move due scheduled retries back onto the pending list.
fn promote_script() -> Script {
    Script::new(
        r#"
        local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, 100)
        for _, task in ipairs(due) do
          redis.call("ZREM", KEYS[1], task)
          redis.call("LPUSH", KEYS[2], task)
        end
        return #due
        "#,
    )
}

/// A dequeued task together with its raw wire form, which is needed to
/// remove it from the in-flight list on completion.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: TaskEnvelope,
    raw: String,
}

/// Redis-backed queue client. Tasks wait on a pending list, are parked on a
/// per-queue in-flight list while a worker holds them, and failed tasks are
/// either re-scheduled on a ZSET (score = ready-at millis) or dead-lettered.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    name: String,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            name: queue_name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Startup connectivity check.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn pending_key(&self) -> String {
        format!("{KEY_PREFIX}:{}:pending", self.name)
    }

    fn active_key(&self) -> String {
        format!("{KEY_PREFIX}:{}:active", self.name)
    }

    fn scheduled_key(&self) -> String {
        format!("{KEY_PREFIX}:{}:scheduled", self.name)
    }

    fn dead_key(&self) -> String {
        format!("{KEY_PREFIX}:{}:dead", self.name)
    }

    /// Pull the next task, blocking in short intervals so `cancel` is
    /// honored. Returns `None` once cancelled.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            promote_script()
                .key(self.scheduled_key())
                .key(self.pending_key())
                .arg(Utc::now().timestamp_millis())
                .invoke_async::<i64>(&mut conn)
                .await?;

            let raw: Option<String> = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                popped = conn.blmove(
                    self.pending_key(),
                    self.active_key(),
                    Direction::Right,
                    Direction::Left,
                    POLL_WAIT_SECS,
                ) => popped?,
            };

            let Some(raw) = raw else {
                continue;
            };

            match serde_json::from_str::<TaskEnvelope>(&raw) {
                Ok(envelope) => return Ok(Some(Delivery { envelope, raw })),
                Err(err) => {
                    // Unparseable envelope: dead-letter the raw value so it
                    // cannot wedge the queue.
                    warn!(error = %err, "discarding unparseable task envelope");
                    let _: i64 = conn.lrem(self.active_key(), 1, &raw).await?;
                    let _: i64 = conn.lpush(self.dead_key(), &raw).await?;
                }
            }
        }
    }

    /// Apply the handler's verdict to queue state.
    pub async fn settle(&self, delivery: &Delivery, disposition: TaskDisposition) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lrem(self.active_key(), 1, &delivery.raw).await?;

        match disposition {
            TaskDisposition::Completed => Ok(()),
            TaskDisposition::Discard(reason) => {
                warn!(
                    task_id = %delivery.envelope.task_id,
                    reason = %reason,
                    "dead-lettering task"
                );
                let _: i64 = conn.lpush(self.dead_key(), &delivery.raw).await?;
                Ok(())
            }
            TaskDisposition::Retry(reason) => {
                let envelope = &delivery.envelope;
                if envelope.retried >= envelope.max_retry {
                    warn!(
                        task_id = %envelope.task_id,
                        retried = envelope.retried,
                        reason = %reason,
                        "retry budget exhausted, dead-lettering task"
                    );
                    let _: i64 = conn.lpush(self.dead_key(), &delivery.raw).await?;
                    return Ok(());
                }

                let mut next = envelope.clone();
                next.retried += 1;
                let delay = retry_backoff(envelope.retried);
                let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                let encoded = serde_json::to_string(&next)?;
                debug!(
                    task_id = %envelope.task_id,
                    retried = next.retried,
                    delay_secs = delay.as_secs(),
                    reason = %reason,
                    "scheduling task retry"
                );
                let _: i64 = conn.zadd(self.scheduled_key(), encoded, ready_at).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Enqueuer for RedisQueue {
    async fn enqueue_process_image(&self, payload: ProcessImagePayload) -> Result<TaskInfo> {
        let envelope = TaskEnvelope {
            task_id: Uuid::new_v4().simple().to_string(),
            task_type: TASK_TYPE_PROCESS_IMAGE.to_string(),
            retried: 0,
            max_retry: DEFAULT_MAX_RETRY,
            timeout_secs: DEFAULT_TASK_TIMEOUT.as_secs(),
            enqueued_at: Utc::now(),
            payload: serde_json::to_value(&payload)?,
        };

        let encoded = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(self.pending_key(), encoded).await?;

        Ok(TaskInfo {
            task_id: envelope.task_id,
            queue: self.name.clone(),
            state: "pending".to_string(),
            enqueued_at: envelope.enqueued_at,
        })
    }
}
