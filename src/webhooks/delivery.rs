// Delivery records and the delivery state machine
//
// pending  -> delivered | retrying | failed
// retrying -> delivered | retrying | failed
//
// delivered and failed are terminal. Records are mutated only by the
// dispatcher and kept after they finish for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{WebhookError, WebhookResult};

/// Response body recorded when the endpoint was inactive at dispatch time
pub const ENDPOINT_INACTIVE: &str = "endpoint inactive";

/// Delivery lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, no attempt made yet
    Pending,
    /// Receiver answered 2xx
    Delivered,
    /// Last attempt failed, another is scheduled
    Retrying,
    /// Endpoint inactive or attempts exhausted
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }

    /// Validate a move to `to`
    pub fn transition(self, to: DeliveryStatus) -> WebhookResult<DeliveryStatus> {
        use DeliveryStatus::*;
        match (self, to) {
            (Pending | Retrying, Delivered | Retrying | Failed) => Ok(to),
            (from, to) => Err(WebhookError::IllegalTransition { from, to }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event sent (or being sent) to one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the next attempt is due, while retrying
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// A fresh pending delivery
    pub fn new(endpoint_id: Uuid, event: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            endpoint_id,
            event: event.into(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_code: None,
            response_body: None,
            delivered_at: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a 2xx response
    pub fn record_success(
        &mut self,
        response_code: u16,
        response_body: Option<String>,
    ) -> WebhookResult<()> {
        self.status = self.status.transition(DeliveryStatus::Delivered)?;
        let now = Utc::now();
        self.attempts += 1;
        self.response_code = Some(response_code);
        self.response_body = response_body;
        self.delivered_at = Some(now);
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Record a non-2xx response or a transport failure
    ///
    /// Returns the new status: `Retrying` while attempts remain, `Failed` once
    /// `max_attempts` is reached.
    pub fn record_failure(
        &mut self,
        response_code: Option<u16>,
        response_body: Option<String>,
        max_attempts: u32,
    ) -> WebhookResult<DeliveryStatus> {
        let attempts = self.attempts + 1;
        let next = if attempts < max_attempts {
            DeliveryStatus::Retrying
        } else {
            DeliveryStatus::Failed
        };
        self.status = self.status.transition(next)?;
        self.attempts = attempts;
        self.response_code = response_code;
        self.response_body = response_body;
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
        Ok(self.status)
    }

    /// Fail without an attempt because the endpoint is inactive
    pub fn record_endpoint_inactive(&mut self) -> WebhookResult<()> {
        self.fail_permanently(ENDPOINT_INACTIVE)
    }

    /// Fail without an attempt, recording `reason`
    pub fn fail_permanently(&mut self, reason: &str) -> WebhookResult<()> {
        self.status = self.status.transition(DeliveryStatus::Failed)?;
        self.response_code = None;
        self.response_body = Some(reason.to_string());
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Truncate a response body to at most `limit` characters
pub fn truncate_body(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}

/// In-memory delivery store
#[derive(Debug, Clone, Default)]
pub struct DeliveryStore {
    deliveries: Arc<RwLock<HashMap<Uuid, Delivery>>>,
}

impl DeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, delivery: Delivery) {
        let mut deliveries = self.deliveries.write().await;
        deliveries.insert(delivery.id, delivery);
    }

    pub async fn get(&self, id: Uuid) -> Option<Delivery> {
        let deliveries = self.deliveries.read().await;
        deliveries.get(&id).cloned()
    }

    /// Persist an updated delivery
    ///
    /// Returns false (and leaves the row alone) when the stored row already
    /// reached a terminal state or has been deleted, so a duplicate dispatch
    /// can never overwrite a final outcome.
    pub async fn commit(&self, delivery: Delivery) -> bool {
        let mut deliveries = self.deliveries.write().await;
        match deliveries.get_mut(&delivery.id) {
            Some(stored)
                if !stored.status.is_terminal() && stored.attempts <= delivery.attempts =>
            {
                *stored = delivery;
                true
            }
            _ => false,
        }
    }

    /// Deliveries for an endpoint, most recent first
    pub async fn for_endpoint(&self, endpoint_id: Uuid) -> Vec<Delivery> {
        let deliveries = self.deliveries.read().await;
        let mut matching: Vec<Delivery> = deliveries
            .values()
            .filter(|d| d.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching
    }

    /// Drop every delivery of a deleted endpoint, returning how many went
    pub async fn remove_for_endpoint(&self, endpoint_id: Uuid) -> usize {
        let mut deliveries = self.deliveries.write().await;
        let before = deliveries.len();
        deliveries.retain(|_, d| d.endpoint_id != endpoint_id);
        before - deliveries.len()
    }

    /// Deliveries that are not yet terminal
    pub async fn unfinished(&self) -> Vec<Delivery> {
        let deliveries = self.deliveries.read().await;
        deliveries
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery() -> Delivery {
        Delivery::new(Uuid::new_v4(), "community.created", json!({"id": "X"}))
    }

    #[test]
    fn test_allowed_transitions() {
        use DeliveryStatus::*;
        for from in [Pending, Retrying] {
            for to in [Delivered, Retrying, Failed] {
                assert_eq!(from.transition(to).unwrap(), to);
            }
        }
    }

    #[test]
    fn test_terminal_states_do_not_move() {
        use DeliveryStatus::*;
        for from in [Delivered, Failed] {
            for to in [Pending, Delivered, Retrying, Failed] {
                assert!(from.transition(to).is_err(), "{} -> {} should be illegal", from, to);
            }
        }
    }

    #[test]
    fn test_nothing_moves_back_to_pending() {
        use DeliveryStatus::*;
        for from in [Pending, Retrying, Delivered, Failed] {
            assert!(from.transition(Pending).is_err());
        }
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(DeliveryStatus::Retrying).unwrap(), json!("retrying"));
        assert_eq!(DeliveryStatus::Delivered.to_string(), "delivered");
    }

    #[test]
    fn test_record_success() {
        let mut d = delivery();
        d.record_success(200, Some("{\"ok\":true}".to_string())).unwrap();

        assert_eq!(d.status, DeliveryStatus::Delivered);
        assert_eq!(d.attempts, 1);
        assert_eq!(d.response_code, Some(200));
        assert!(d.delivered_at.is_some());
    }

    #[test]
    fn test_failures_until_exhausted() {
        let mut d = delivery();
        for expected_attempts in 1..5 {
            let status = d.record_failure(Some(500), None, 5).unwrap();
            assert_eq!(status, DeliveryStatus::Retrying);
            assert_eq!(d.attempts, expected_attempts);
            assert!(d.delivered_at.is_none());
        }

        let status = d.record_failure(Some(500), None, 5).unwrap();
        assert_eq!(status, DeliveryStatus::Failed);
        assert_eq!(d.attempts, 5);

        // Terminal: further recording is rejected and nothing changes
        assert!(d.record_failure(Some(500), None, 5).is_err());
        assert!(d.record_success(200, None).is_err());
        assert_eq!(d.attempts, 5);
        assert_eq!(d.status, DeliveryStatus::Failed);
    }

    #[test]
    fn test_retry_then_success() {
        let mut d = delivery();
        d.record_failure(None, Some("connection refused".to_string()), 5).unwrap();
        d.record_success(204, None).unwrap();
        assert_eq!(d.status, DeliveryStatus::Delivered);
        assert_eq!(d.attempts, 2);
    }

    #[test]
    fn test_endpoint_inactive() {
        let mut d = delivery();
        d.record_endpoint_inactive().unwrap();
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.attempts, 0);
        assert_eq!(d.response_body.as_deref(), Some(ENDPOINT_INACTIVE));
        assert!(d.delivered_at.is_none());
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("hello", 10), "hello");
        assert_eq!(truncate_body("hello", 3), "hel");
        assert_eq!(truncate_body("héllo", 2), "hé");
        assert_eq!(truncate_body("", 0), "");
    }

    #[tokio::test]
    async fn test_commit_refuses_terminal_overwrite() {
        let store = DeliveryStore::new();
        let d = delivery();
        store.insert(d.clone()).await;

        let mut delivered = d.clone();
        delivered.record_success(200, None).unwrap();
        assert!(store.commit(delivered).await);

        // A duplicate worker that loaded the pending row loses
        let mut stale = d.clone();
        stale.record_failure(Some(500), None, 5).unwrap();
        assert!(!store.commit(stale).await);

        let stored = store.get(d.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_for_endpoint_and_cascade() {
        let store = DeliveryStore::new();
        let endpoint_id = Uuid::new_v4();
        for _ in 0..3 {
            store.insert(Delivery::new(endpoint_id, "post.created", json!({}))).await;
        }
        store.insert(delivery()).await;

        assert_eq!(store.for_endpoint(endpoint_id).await.len(), 3);
        assert_eq!(store.unfinished().await.len(), 4);
        assert_eq!(store.remove_for_endpoint(endpoint_id).await, 3);
        assert!(store.for_endpoint(endpoint_id).await.is_empty());
    }
}
