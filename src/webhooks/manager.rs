// Webhook manager - ties registry, delivery store and queue together
//
// Manages:
// - Endpoint lifecycle on behalf of an actor
// - Fan-out of domain events into pending deliveries
// - The connectivity test trigger
// - Delivery listings for endpoint owners

use chrono::Utc;
use reqwest::header::HeaderValue;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{WebhookError, WebhookResult};
use crate::metrics;
use crate::webhooks::delivery::{Delivery, DeliveryStore};
use crate::webhooks::endpoint::{
    Actor, Endpoint, EndpointRegistry, EndpointUpdate, NewEndpoint, RegisteredEndpoint,
};
use crate::webhooks::queue::DeliveryQueue;

/// Event type of the synthetic delivery created by the test trigger
pub const TEST_EVENT: &str = "webhook.test";

/// Webhook manager
#[derive(Debug, Clone)]
pub struct WebhookManager {
    endpoints: EndpointRegistry,
    deliveries: DeliveryStore,
    queue: DeliveryQueue,
}

impl WebhookManager {
    pub fn new(
        endpoints: EndpointRegistry,
        deliveries: DeliveryStore,
        queue: DeliveryQueue,
    ) -> Self {
        Self {
            endpoints,
            deliveries,
            queue,
        }
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn deliveries(&self) -> &DeliveryStore {
        &self.deliveries
    }

    /// Register an endpoint
    pub async fn register_endpoint(
        &self,
        actor: &Actor,
        new: NewEndpoint,
    ) -> WebhookResult<RegisteredEndpoint> {
        self.endpoints.register(actor, new).await
    }

    pub async fn endpoint(&self, actor: &Actor, id: Uuid) -> WebhookResult<Endpoint> {
        self.endpoints.get(actor, id).await
    }

    pub async fn list_endpoints(&self, actor: &Actor) -> Vec<Endpoint> {
        self.endpoints.list(actor).await
    }

    pub async fn update_endpoint(
        &self,
        actor: &Actor,
        id: Uuid,
        update: EndpointUpdate,
    ) -> WebhookResult<Endpoint> {
        self.endpoints.update(actor, id, update).await
    }

    pub async fn deactivate_endpoint(&self, actor: &Actor, id: Uuid) -> WebhookResult<Endpoint> {
        self.endpoints.deactivate(actor, id).await
    }

    /// Delete an endpoint and every delivery it owns
    pub async fn delete_endpoint(&self, actor: &Actor, id: Uuid) -> WebhookResult<()> {
        self.endpoints.delete(actor, id).await?;
        let removed = self.deliveries.remove_for_endpoint(id).await;
        info!(
            endpoint_id = %id,
            deliveries_removed = removed,
            "Endpoint deleted with its deliveries"
        );
        Ok(())
    }

    /// Fan an event out to every active subscribed endpoint
    ///
    /// Returns the ids of the deliveries created. Delivery outcomes are never
    /// reported back to the producer.
    ///
    /// # Errors
    ///
    /// `Validation` if `event` cannot be sent as the event header.
    pub async fn publish(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> WebhookResult<Vec<Uuid>> {
        validate_event(event)?;

        let subscribers = self.endpoints.subscribers(event).await;
        if subscribers.is_empty() {
            debug!(event = %event, "No active endpoints subscribed to event");
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(subscribers.len());
        for endpoint in subscribers {
            let delivery = Delivery::new(endpoint.id, event, payload.clone());
            ids.push(self.enqueue(delivery).await?);
        }

        info!(event = %event, deliveries = ids.len(), "Published event");
        Ok(ids)
    }

    /// Create and enqueue a `webhook.test` delivery for one endpoint
    pub async fn trigger_test(&self, actor: &Actor, endpoint_id: Uuid) -> WebhookResult<Delivery> {
        let endpoint = self.endpoints.get(actor, endpoint_id).await?;

        let payload = json!({
            "endpoint_id": endpoint.id,
            "message": "This is a test webhook delivery",
            "triggered_at": Utc::now(),
        });
        let delivery = Delivery::new(endpoint.id, TEST_EVENT, payload);
        let snapshot = delivery.clone();
        self.enqueue(delivery).await?;

        info!(endpoint_id = %endpoint.id, delivery_id = %snapshot.id, "Queued test delivery");
        Ok(snapshot)
    }

    /// Deliveries of one endpoint, newest first
    pub async fn deliveries_for(
        &self,
        actor: &Actor,
        endpoint_id: Uuid,
    ) -> WebhookResult<Vec<Delivery>> {
        self.endpoints.get(actor, endpoint_id).await?;
        Ok(self.deliveries.for_endpoint(endpoint_id).await)
    }

    /// A single delivery, visible to the owner of its endpoint
    pub async fn delivery(&self, actor: &Actor, id: Uuid) -> WebhookResult<Delivery> {
        let delivery = self
            .deliveries
            .get(id)
            .await
            .ok_or(WebhookError::DeliveryNotFound(id))?;
        self.endpoints.get(actor, delivery.endpoint_id).await?;
        Ok(delivery)
    }

    async fn enqueue(&self, delivery: Delivery) -> WebhookResult<Uuid> {
        let id = delivery.id;
        self.deliveries.insert(delivery).await;
        metrics::DELIVERIES_CREATED_TOTAL.inc();
        self.queue.enqueue(id)?;
        Ok(id)
    }
}

/// Event types travel in `X-Webhook-Event`, so they must be valid header values
fn validate_event(event: &str) -> WebhookResult<()> {
    if event.is_empty() || HeaderValue::from_str(event).is_err() {
        return Err(WebhookError::validation(
            "Invalid event type",
            format!("Event type {:?} is empty or not a valid header value", event),
        ));
    }
    Ok(())
}
