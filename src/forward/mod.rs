//! Stage Forwarder — retrying delivery of envelopes to the next stage.
//!
//! Before first delivery the forwarder resolves the target's capability
//! descriptor (agent card) to confirm the target accepts the envelope's
//! schema. If discovery itself fails, delivery degrades to the well-known
//! `/tasks` path with a warning — the pipeline keeps functioning when the
//! discovery layer is flaky, at the cost of skipping the capability check.
//!
//! Transient failures (connect errors, timeouts, 5xx, 429) are retried with
//! capped exponential backoff. Any other 4xx, or an unparseable response
//! body, fails immediately as permanent.

use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Well-known path of the capability descriptor.
pub const AGENT_CARD_PATH: &str = "/.well-known/agent-card.json";

/// Default task endpoint path used when discovery is unavailable.
pub const TASKS_PATH: &str = "/tasks";

/// Retry tuning knobs. Defaults: 3 attempts, 1s initial delay, 2.0
/// multiplier, 10s cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (0-based), capped.
    fn delay_after(&self, attempt: u32) -> Duration {
        let scaled =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Capability descriptor served by every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub accepted_schemas: Vec<String>,
    pub outbound_schema: Option<String>,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Synchronous reply from a stage's task endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Successful delivery plus attempt accounting for diagnostics.
#[derive(Debug)]
pub struct Delivery {
    pub response: RemoteResponse,
    pub attempts: u32,
    /// False when discovery failed and the capability check was skipped.
    pub capability_checked: bool,
}

/// Forwarding failures.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Non-retriable: 4xx (other than 429), schema not accepted by the
    /// target, or a malformed downstream response.
    #[error("permanent forward error (status {status}): {body}")]
    Permanent { status: u16, body: String },
    /// All retry attempts consumed. Treated like a permanent error by the
    /// caller, but carries the attempt count for diagnostics.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Resolved delivery target: a plain value, not a client object graph.
#[derive(Debug, Clone)]
struct ResolvedTarget {
    tasks_url: String,
    capability_checked: bool,
}

/// Retrying HTTP client used by every stage to hand work downstream.
#[derive(Clone)]
pub struct StageForwarder {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl StageForwarder {
    pub fn new(policy: RetryPolicy) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver `envelope` to the stage at `base_url`.
    ///
    /// Runs discovery first; a target whose card does not list the
    /// envelope's schema is a permanent error (the refuse-unknown-schema
    /// rule, enforced from the sending side too). Then attempts delivery up
    /// to `max_retries` times total.
    pub async fn forward(
        &self,
        envelope: &Envelope,
        base_url: &str,
    ) -> Result<Delivery, ForwardError> {
        let base = base_url.trim_end_matches('/');
        let target = self.resolve(base, envelope.schema.as_str()).await?;
        let body = serde_json::to_value(envelope)?;

        let mut last_error = String::new();
        for attempt in 0..self.policy.max_retries {
            if attempt > 0 {
                let delay = self.policy.delay_after(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying forward");
                tokio::time::sleep(delay).await;
            }

            match self.http.post(&target.tasks_url).json(&body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        let parsed: RemoteResponse =
                            serde_json::from_str(&text).map_err(|_| {
                                ForwardError::Permanent {
                                    status: status.as_u16(),
                                    body: format!("malformed downstream response: {text}"),
                                }
                            })?;
                        debug!(
                            url = %target.tasks_url,
                            attempts = attempt + 1,
                            "envelope delivered"
                        );
                        return Ok(Delivery {
                            response: parsed,
                            attempts: attempt + 1,
                            capability_checked: target.capability_checked,
                        });
                    }

                    let transient = status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
                    let text = resp.text().await.unwrap_or_default();
                    if !transient {
                        return Err(ForwardError::Permanent {
                            status: status.as_u16(),
                            body: text,
                        });
                    }
                    last_error = format!("HTTP {status}: {text}");
                    warn!(url = %target.tasks_url, attempt = attempt + 1, error = %last_error, "transient forward failure");
                }
                Err(e) => {
                    // Connect/timeout errors are transient by definition here.
                    last_error = e.to_string();
                    warn!(url = %target.tasks_url, attempt = attempt + 1, error = %last_error, "forward request failed");
                }
            }
        }

        Err(ForwardError::ExhaustedRetries {
            attempts: self.policy.max_retries,
            last_error,
        })
    }

    /// Discovery step: fetch the target's agent card and confirm it accepts
    /// `schema`. On fetch failure, fall back to the default task path in
    /// degraded mode.
    async fn resolve(&self, base: &str, schema: &str) -> Result<ResolvedTarget, ForwardError> {
        let card_url = format!("{base}{AGENT_CARD_PATH}");
        match self.fetch_card(&card_url).await {
            Some(card) => {
                if !card.accepted_schemas.iter().any(|s| s == schema) {
                    return Err(ForwardError::Permanent {
                        status: 0,
                        body: format!(
                            "target '{}' does not accept schema '{schema}' (accepts: {})",
                            card.name,
                            card.accepted_schemas.join(", ")
                        ),
                    });
                }
                let endpoint = if card.endpoint.starts_with("http") {
                    card.endpoint.clone()
                } else {
                    format!("{base}{}", card.endpoint)
                };
                info!(target = %card.name, schema, "capability check passed");
                Ok(ResolvedTarget {
                    tasks_url: endpoint,
                    capability_checked: true,
                })
            }
            None => {
                warn!(
                    url = %card_url,
                    "discovery failed, degrading to direct delivery without capability check"
                );
                Ok(ResolvedTarget {
                    tasks_url: format!("{base}{TASKS_PATH}"),
                    capability_checked: false,
                })
            }
        }
    }

    async fn fetch_card(&self, url: &str) -> Option<AgentCard> {
        let resp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<AgentCard>().await.ok()
    }
}
