use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::Client;
use sha2::Sha256;
use tracing::{info, warn};

use crate::core::config::DispatcherConfig;
use crate::core::store::types::AgentRecord;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_EXECUTE: &str = "agent.execute";
pub const EVENT_PING: &str = "agent.ping";

/// Sleep abstraction so retry/backoff tests run without wall-clock delay.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of one webhook attempt.
enum Classification {
    Success(serde_json::Value),
    Retryable { code: &'static str, reason: String },
    Permanent { code: &'static str, reason: String },
}

/// Final outcome of the whole retry loop.
#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    Success { output: serde_json::Value },
    Failure { code: &'static str, reason: String },
}

/// What the invoker hands back for audit: the last classification plus how
/// many attempts were made.
#[derive(Debug, Clone)]
pub struct InvokeReport {
    pub outcome: InvokeOutcome,
    pub attempts: u32,
}

/// Performs the signed outbound HTTP call with per-attempt timeout and a
/// bounded retry loop. Attempts are strictly sequential; the backoff delay of
/// one attempt is fully observed before the next starts.
pub struct WebhookInvoker {
    client: Client,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
}

impl WebhookInvoker {
    pub fn new(config: DispatcherConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: Client::new(),
            config,
            clock,
        }
    }

    /// Runs the retry loop for one execution. PermanentFailure is never
    /// retried; RetryableFailure is retried up to `max_retry_attempts` within
    /// the wall-clock retry budget.
    pub async fn invoke(
        &self,
        agent: &AgentRecord,
        request_id: &str,
        input: &serde_json::Value,
    ) -> Result<InvokeReport> {
        let body = signed_body(EVENT_EXECUTE, request_id, input)?;
        let signature = sign_payload(&agent.webhook_secret, &body)?;

        let budget = self.config.retry_budget();
        let loop_started = std::time::Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt_started = std::time::Instant::now();
            let classification = self
                .single_attempt(
                    &agent.webhook_url,
                    &body,
                    &signature,
                    request_id,
                    EVENT_EXECUTE,
                    self.config.webhook_timeout,
                )
                .await;
            let elapsed_ms = attempt_started.elapsed().as_millis();

            match classification {
                Classification::Success(output) => {
                    info!(
                        "Webhook attempt {}/{} for request {} succeeded in {}ms",
                        attempts, self.config.max_retry_attempts, request_id, elapsed_ms
                    );
                    return Ok(InvokeReport {
                        outcome: InvokeOutcome::Success { output },
                        attempts,
                    });
                }
                Classification::Permanent { code, reason } => {
                    warn!(
                        "Webhook attempt {}/{} for request {} failed permanently ({code}) in {}ms: {reason}",
                        attempts, self.config.max_retry_attempts, request_id, elapsed_ms
                    );
                    return Ok(InvokeReport {
                        outcome: InvokeOutcome::Failure { code, reason },
                        attempts,
                    });
                }
                Classification::Retryable { code, reason } => {
                    warn!(
                        "Webhook attempt {}/{} for request {} failed ({code}) in {}ms: {reason}",
                        attempts, self.config.max_retry_attempts, request_id, elapsed_ms
                    );
                    if exhausted(
                        attempts,
                        self.config.max_retry_attempts,
                        loop_started.elapsed(),
                        budget,
                    ) {
                        return Ok(InvokeReport {
                            outcome: InvokeOutcome::Failure { code, reason },
                            attempts,
                        });
                    }
                    let delay = self.backoff_delay(attempts);
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    /// One-time connectivity test used at agent registration, on its own
    /// shorter budget. Single attempt, no retries.
    pub async fn ping(&self, webhook_url: &str, webhook_secret: &str) -> Result<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let body = signed_body(EVENT_PING, &request_id, &serde_json::json!({}))?;
        let signature = sign_payload(webhook_secret, &body)?;
        let classification = self
            .single_attempt(
                webhook_url,
                &body,
                &signature,
                &request_id,
                EVENT_PING,
                self.config.connectivity_test_timeout,
            )
            .await;
        match classification {
            Classification::Success(_) => Ok(()),
            Classification::Retryable { code, reason }
            | Classification::Permanent { code, reason } => {
                Err(anyhow!("connectivity test failed ({code}): {reason}"))
            }
        }
    }

    async fn single_attempt(
        &self,
        url: &str,
        body: &str,
        signature: &str,
        request_id: &str,
        event: &str,
        timeout: Duration,
    ) -> Classification {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", format!("sha256={signature}"))
            .header("X-Request-Id", request_id)
            .header("X-Webhook-Event", event)
            .body(body.to_string())
            .send()
            .await;

        let response = match response {
            Ok(res) => res,
            Err(e) if e.is_timeout() => {
                return Classification::Retryable {
                    code: "WebhookTimeout",
                    reason: format!("no response within {}ms", timeout.as_millis()),
                };
            }
            Err(e) => {
                return Classification::Retryable {
                    code: "WebhookUnreachable",
                    reason: e.to_string(),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let output = serde_json::from_str(&text)
                .unwrap_or_else(|_| serde_json::json!({ "raw": text }));
            return Classification::Success(output);
        }

        let reason = format!(
            "agent responded with HTTP {}: {}",
            status.as_u16(),
            response.text().await.unwrap_or_default()
        );
        // 408/429 and all 5xx are worth retrying; any other 4xx is a
        // deliberate rejection by the agent.
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            Classification::Retryable {
                code: "WebhookRejected",
                reason,
            }
        } else {
            Classification::Permanent {
                code: "WebhookRejected",
                reason,
            }
        }
    }

    /// Exponential backoff with jitter: base * 2^(attempt-1), capped, plus a
    /// random 0..=jitter slice.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.config.backoff_cap);
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        capped + jitter
    }
}

fn exhausted(attempts: u32, max_attempts: u32, elapsed: Duration, budget: Duration) -> bool {
    attempts >= max_attempts || elapsed >= budget
}

fn signed_body(
    event: &str,
    request_id: &str,
    input: &serde_json::Value,
) -> Result<String> {
    let payload = serde_json::json!({
        "event": event,
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "requestId": request_id,
        "input": input,
    });
    Ok(serde_json::to_string(&payload)?)
}

/// HMAC-SHA256 over the exact request body, hex encoded. Agents verify with
/// their webhook secret.
pub fn sign_payload(secret: &str, body: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("invalid webhook secret: {e}"))?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
