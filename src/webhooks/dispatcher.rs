// Webhook dispatcher
//
// Performs the signed HTTP call for one delivery, classifies the response
// and advances the delivery state machine. One invocation makes at most one
// outbound request and one store update.

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{WebhookError, WebhookResult};
use crate::metrics;
use crate::webhooks::delivery::{truncate_body, Delivery, DeliveryStatus, DeliveryStore};
use crate::webhooks::endpoint::{Endpoint, EndpointRegistry};
use crate::webhooks::retry::RetryDecision;
use crate::webhooks::signer::{
    self, DELIVERY_ID_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

/// Body POSTed to the receiver
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub event: &'a str,
    pub timestamp: DateTime<Utc>,
    pub data: &'a serde_json::Value,
}

/// What a dispatch did
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Receiver answered 2xx
    Delivered,
    /// Attempt failed; re-enqueue after this delay
    Retry(Duration),
    /// Delivery is now permanently failed
    Failed,
    /// Delivery was already terminal (or another worker won); nothing done
    Skipped(DeliveryStatus),
}

/// Result of one outbound POST
#[derive(Debug)]
enum Attempt {
    Success { code: u16, body: String },
    Failure { code: Option<u16>, body: String },
    /// The request could not be built; no call was made
    Rejected { reason: String },
}

/// Delivery dispatcher
pub struct Dispatcher {
    endpoints: EndpointRegistry,
    deliveries: DeliveryStore,
    client: reqwest::Client,
    config: DeliveryConfig,
}

impl Dispatcher {
    /// Create a dispatcher with a shared HTTP client
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the HTTP client cannot be built.
    pub fn new(
        endpoints: EndpointRegistry,
        deliveries: DeliveryStore,
        config: DeliveryConfig,
    ) -> WebhookResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoints,
            deliveries,
            client,
            config,
        })
    }

    /// Dispatch one delivery
    ///
    /// # Errors
    ///
    /// Only `DeliveryNotFound`. Every transport problem is recorded on the
    /// delivery instead of being returned.
    pub async fn dispatch(&self, delivery_id: Uuid) -> WebhookResult<DispatchOutcome> {
        let mut delivery = self
            .deliveries
            .get(delivery_id)
            .await
            .ok_or(WebhookError::DeliveryNotFound(delivery_id))?;

        if delivery.status.is_terminal() {
            debug!(
                delivery_id = %delivery_id,
                status = %delivery.status,
                "Delivery already final, skipping"
            );
            return Ok(DispatchOutcome::Skipped(delivery.status));
        }

        let endpoint = match self.endpoints.find(delivery.endpoint_id).await {
            Some(endpoint) if endpoint.active => endpoint,
            Some(_) => {
                info!(
                    delivery_id = %delivery_id,
                    endpoint_id = %delivery.endpoint_id,
                    "Endpoint inactive, failing delivery"
                );
                delivery.record_endpoint_inactive()?;
                metrics::record_attempt("inactive");
                return self.persist(delivery, DispatchOutcome::Failed).await;
            }
            None => {
                warn!(
                    delivery_id = %delivery_id,
                    endpoint_id = %delivery.endpoint_id,
                    "Endpoint missing, failing delivery"
                );
                delivery.fail_permanently("endpoint not found")?;
                metrics::record_attempt("inactive");
                return self.persist(delivery, DispatchOutcome::Failed).await;
            }
        };

        match self.attempt(&endpoint, &delivery).await {
            Attempt::Success { code, body } => {
                delivery.record_success(code, Some(body))?;
                info!(
                    delivery_id = %delivery_id,
                    endpoint_id = %endpoint.id,
                    event = %delivery.event,
                    response_code = code,
                    attempts = delivery.attempts,
                    "Webhook delivered"
                );
                metrics::record_attempt("delivered");
                self.persist(delivery, DispatchOutcome::Delivered).await
            }
            Attempt::Failure { code, body } => self.settle_failure(delivery, code, body).await,
            Attempt::Rejected { reason } => {
                warn!(
                    delivery_id = %delivery_id,
                    endpoint_id = %endpoint.id,
                    event = %delivery.event,
                    reason = %reason,
                    "Webhook request rejected before sending, failing delivery"
                );
                let reason = truncate_body(&reason, self.config.response_body_limit);
                delivery.fail_permanently(&reason)?;
                metrics::record_attempt("failed");
                self.persist(delivery, DispatchOutcome::Failed).await
            }
        }
    }

    /// Record a dispatch that died without producing an outcome
    ///
    /// Treated as a transport failure so the delivery never stays pending.
    pub async fn record_crash(
        &self,
        delivery_id: Uuid,
        reason: &str,
    ) -> WebhookResult<DispatchOutcome> {
        let delivery = self
            .deliveries
            .get(delivery_id)
            .await
            .ok_or(WebhookError::DeliveryNotFound(delivery_id))?;

        if delivery.status.is_terminal() {
            return Ok(DispatchOutcome::Skipped(delivery.status));
        }

        let body = truncate_body(reason, self.config.response_body_limit);
        self.settle_failure(delivery, None, body).await
    }

    async fn settle_failure(
        &self,
        mut delivery: Delivery,
        code: Option<u16>,
        body: String,
    ) -> WebhookResult<DispatchOutcome> {
        let status = delivery.record_failure(code, Some(body), self.config.retry.max_attempts)?;

        let outcome = match (status, self.config.retry.next(delivery.attempts)) {
            (DeliveryStatus::Retrying, RetryDecision::Retry(delay)) => {
                let due = chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                delivery.next_attempt_at = Some(Utc::now() + due);
                DispatchOutcome::Retry(delay)
            }
            _ => DispatchOutcome::Failed,
        };

        warn!(
            delivery_id = %delivery.id,
            endpoint_id = %delivery.endpoint_id,
            event = %delivery.event,
            response_code = ?code,
            attempts = delivery.attempts,
            max_attempts = self.config.retry.max_attempts,
            status = %delivery.status,
            "Webhook delivery attempt failed"
        );
        metrics::record_attempt(delivery.status.as_str());

        self.persist(delivery, outcome).await
    }

    async fn persist(
        &self,
        delivery: Delivery,
        outcome: DispatchOutcome,
    ) -> WebhookResult<DispatchOutcome> {
        let id = delivery.id;
        if self.deliveries.commit(delivery).await {
            return Ok(outcome);
        }

        // Another worker finished first, or the endpoint was deleted meanwhile
        let current = self
            .deliveries
            .get(id)
            .await
            .ok_or(WebhookError::DeliveryNotFound(id))?;
        debug!(
            delivery_id = %id,
            status = %current.status,
            "Delivery updated concurrently, discarding result"
        );
        Ok(DispatchOutcome::Skipped(current.status))
    }

    async fn attempt(&self, endpoint: &Endpoint, delivery: &Delivery) -> Attempt {
        let limit = self.config.response_body_limit;
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();

        let envelope = Envelope {
            event: &delivery.event,
            timestamp: now,
            data: &delivery.payload,
        };
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                return Attempt::Rejected {
                    reason: format!("Failed to serialize payload: {}", e),
                }
            }
        };

        let signature = signer::sign(endpoint.secret(), &timestamp, &body);

        let start = Instant::now();
        let result = self
            .client
            .post(&endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, delivery.event.as_str())
            .header(DELIVERY_ID_HEADER, delivery.id.to_string())
            .header(TIMESTAMP_HEADER, timestamp.as_str())
            .header(SIGNATURE_HEADER, signature.as_str())
            .body(body)
            .send()
            .await;
        let elapsed = start.elapsed();
        metrics::DELIVERY_DURATION_SECONDS.observe(elapsed.as_secs_f64());

        match result {
            Ok(response) => {
                let code = response.status().as_u16();
                let body = read_body(response, limit).await;

                debug!(
                    "Webhook {} attempt {} - status {}, time {} ms",
                    delivery.id,
                    delivery.attempts + 1,
                    code,
                    elapsed.as_millis()
                );

                if (200..300).contains(&code) {
                    Attempt::Success { code, body }
                } else {
                    Attempt::Failure { code: Some(code), body }
                }
            }
            Err(e) if e.is_builder() => Attempt::Rejected {
                reason: format!("Request rejected: {}", e),
            },
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("Request timeout ({}s)", self.config.timeout_secs)
                } else if e.is_connect() {
                    format!("Connection failed: {}", e)
                } else {
                    format!("Request error: {}", e)
                };
                Attempt::Failure {
                    code: None,
                    body: truncate_body(&message, limit),
                }
            }
        }
    }
}

/// Read at most `limit` characters of the response body
///
/// Stops pulling chunks once enough bytes for `limit` characters are buffered.
async fn read_body(mut response: reqwest::Response, limit: usize) -> String {
    let cap = limit.saturating_mul(4);
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < cap {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Failed to read webhook response body");
                break;
            }
        }
    }
    truncate_body(&String::from_utf8_lossy(&buf), limit)
}
