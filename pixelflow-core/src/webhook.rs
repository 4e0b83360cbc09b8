//! Signed webhook delivery with bounded exponential-backoff retry.
//!
//! Delivery is at-least-once: the caller re-drives the whole job when every
//! attempt fails, and receivers dedupe on the `job_id` carried in the
//! payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::WebhookConfig;
use crate::error::{PixelflowError, Result};

pub const HEADER_SIGNATURE: &str = "X-Pixelflow-Signature";
pub const HEADER_TIMESTAMP: &str = "X-Pixelflow-Timestamp";
pub const HEADER_EVENT: &str = "X-Pixelflow-Event";

pub const EVENT_JOB_COMPLETED: &str = "job.completed";
pub const EVENT_JOB_FAILED: &str = "job.failed";

/// `sha256=<hex(hmac_sha256(secret, timestamp + "." + body))>`
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub struct WebhookClient {
    http: reqwest::Client,
    signing_secret: String,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl WebhookClient {
    pub fn new(cfg: &WebhookConfig) -> Self {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };
        let initial_backoff = if cfg.initial_backoff.is_zero() {
            Duration::from_secs(1)
        } else {
            cfg.initial_backoff
        };

        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            signing_secret: cfg.signing_secret.clone(),
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff,
            max_backoff: cfg.max_backoff.max(initial_backoff),
        }
    }

    /// POST `payload` to `endpoint`, retrying transport errors and non-2xx
    /// responses. An empty endpoint is a no-op.
    pub async fn send<T: serde::Serialize>(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        event: &str,
        payload: &T,
    ) -> Result<()> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_vec(payload)?;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign(&self.signing_secret, &timestamp, &body);

        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(PixelflowError::Cancelled("webhook delivery".to_string()));
            }

            let response = self
                .http
                .post(endpoint)
                .header("Content-Type", "application/json")
                .header(HEADER_TIMESTAMP, &timestamp)
                .header(HEADER_SIGNATURE, &signature)
                .header(HEADER_EVENT, event)
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_error = format!("webhook returned status={}", resp.status().as_u16());
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }

            debug!(attempt, error = %last_error, "webhook attempt failed");
            if attempt == self.max_attempts {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PixelflowError::Cancelled("webhook delivery".to_string()));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }

        Err(PixelflowError::Webhook {
            attempts: self.max_attempts,
            reason: last_error,
        })
    }
}
