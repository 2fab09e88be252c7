// Endpoint registry
//
// Owns subscriber endpoint records. Only the owner or a platform manager may
// read or manage an endpoint. The signing secret is generated here, once, and
// is never serialized on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{WebhookError, WebhookResult};

/// Who is performing a registry operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub person_id: Uuid,
    /// Platform managers may manage every endpoint
    pub manager: bool,
}

impl Actor {
    pub fn person(person_id: Uuid) -> Self {
        Self {
            person_id,
            manager: false,
        }
    }

    pub fn manager(person_id: Uuid) -> Self {
        Self {
            person_id,
            manager: true,
        }
    }

    fn can_manage(&self, endpoint: &Endpoint) -> bool {
        self.manager || endpoint.owner_id == self.person_id
    }
}

/// A registered subscriber endpoint
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    secret: String,
    pub active: bool,
    /// Subscribed event types, empty means every event
    pub events: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Signing secret shared with the receiver
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Whether this endpoint wants `event`
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.contains(event)
    }

    /// Whether a delivery of `event` should be created for this endpoint
    pub fn accepts(&self, event: &str) -> bool {
        self.active && self.subscribes_to(event)
    }
}

/// Attributes for a new endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewEndpoint {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    /// Managers may register on behalf of another person
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    /// Never accepted; present so a client-supplied secret can be rejected
    #[serde(default)]
    pub secret: Option<String>,
}

/// Partial update; `None` leaves the attribute unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
    /// Never accepted; the secret is write-once
    pub secret: Option<String>,
}

/// Result of registration, the only place the secret is handed out
#[derive(Debug, Clone)]
pub struct RegisteredEndpoint {
    pub endpoint: Endpoint,
    pub secret: String,
}

/// Generate a fresh signing secret: 32 random bytes, hex encoded
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Check that `raw` is an absolute http(s) URL with a host
pub fn validate_url(raw: &str) -> WebhookResult<()> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| {
        WebhookError::validation("Invalid URL", format!("'{}' is not a valid URL: {}", raw, e))
    })?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(WebhookError::validation(
                "Invalid URL",
                format!("Unsupported URL scheme: {}", scheme),
            ))
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(WebhookError::validation("Invalid URL", "URL must have a host"));
    }

    Ok(())
}

fn validate_name(name: &str) -> WebhookResult<()> {
    if name.trim().is_empty() {
        return Err(WebhookError::validation("Invalid name", "Name must not be blank"));
    }
    Ok(())
}

fn normalize_events(events: Vec<String>) -> WebhookResult<BTreeSet<String>> {
    let mut set = BTreeSet::new();
    for event in events {
        let event = event.trim().to_string();
        if event.is_empty() {
            return Err(WebhookError::validation(
                "Invalid event filter",
                "Event types must not be blank",
            ));
        }
        set.insert(event);
    }
    Ok(set)
}

fn reject_secret(secret: &Option<String>) -> WebhookResult<()> {
    if secret.is_some() {
        return Err(WebhookError::validation(
            "Secret is read-only",
            "The signing secret is generated by the server and cannot be set or changed",
        ));
    }
    Ok(())
}

/// In-memory endpoint store
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Arc<RwLock<HashMap<Uuid, Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint with a freshly generated secret
    pub async fn register(
        &self,
        actor: &Actor,
        new: NewEndpoint,
    ) -> WebhookResult<RegisteredEndpoint> {
        reject_secret(&new.secret)?;
        validate_name(&new.name)?;
        validate_url(&new.url)?;
        let events = normalize_events(new.events)?;

        let owner_id = match new.owner_id {
            Some(owner) if owner != actor.person_id && !actor.manager => {
                return Err(WebhookError::Forbidden(
                    "only platform managers may register endpoints for other people".to_string(),
                ))
            }
            Some(owner) => owner,
            None => actor.person_id,
        };

        let now = Utc::now();
        let secret = generate_secret();
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            owner_id,
            name: new.name.trim().to_string(),
            url: new.url.trim().to_string(),
            secret: secret.clone(),
            active: true,
            events,
            created_at: now,
            updated_at: now,
        };

        info!(
            endpoint_id = %endpoint.id,
            owner_id = %owner_id,
            url = %endpoint.url,
            "Registered webhook endpoint"
        );

        let mut endpoints = self.endpoints.write().await;
        endpoints.insert(endpoint.id, endpoint.clone());

        Ok(RegisteredEndpoint { endpoint, secret })
    }

    /// Fetch an endpoint the actor may manage
    pub async fn get(&self, actor: &Actor, id: Uuid) -> WebhookResult<Endpoint> {
        let endpoint = self.find(id).await.ok_or(WebhookError::EndpointNotFound(id))?;
        if !actor.can_manage(&endpoint) {
            return Err(WebhookError::Forbidden(
                "endpoint belongs to another person".to_string(),
            ));
        }
        Ok(endpoint)
    }

    /// Unscoped lookup for the dispatcher
    pub async fn find(&self, id: Uuid) -> Option<Endpoint> {
        let endpoints = self.endpoints.read().await;
        endpoints.get(&id).cloned()
    }

    /// Apply a partial update
    pub async fn update(
        &self,
        actor: &Actor,
        id: Uuid,
        update: EndpointUpdate,
    ) -> WebhookResult<Endpoint> {
        reject_secret(&update.secret)?;
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(url) = &update.url {
            validate_url(url)?;
        }
        let events = update.events.map(normalize_events).transpose()?;

        let mut endpoints = self.endpoints.write().await;
        let endpoint = endpoints.get_mut(&id).ok_or(WebhookError::EndpointNotFound(id))?;
        if !actor.can_manage(endpoint) {
            return Err(WebhookError::Forbidden(
                "endpoint belongs to another person".to_string(),
            ));
        }

        if let Some(name) = update.name {
            endpoint.name = name.trim().to_string();
        }
        if let Some(url) = update.url {
            endpoint.url = url.trim().to_string();
        }
        if let Some(events) = events {
            endpoint.events = events;
        }
        if let Some(active) = update.active {
            endpoint.active = active;
        }
        endpoint.updated_at = Utc::now();

        info!(endpoint_id = %id, "Updated webhook endpoint");
        Ok(endpoint.clone())
    }

    /// Stop deliveries without losing history
    pub async fn deactivate(&self, actor: &Actor, id: Uuid) -> WebhookResult<Endpoint> {
        self.update(
            actor,
            id,
            EndpointUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    /// Remove an endpoint; the caller cascades its deliveries
    pub async fn delete(&self, actor: &Actor, id: Uuid) -> WebhookResult<Endpoint> {
        let mut endpoints = self.endpoints.write().await;
        let endpoint = endpoints.get(&id).ok_or(WebhookError::EndpointNotFound(id))?;
        if !actor.can_manage(endpoint) {
            return Err(WebhookError::Forbidden(
                "endpoint belongs to another person".to_string(),
            ));
        }
        let removed = endpoints.remove(&id).ok_or(WebhookError::EndpointNotFound(id))?;
        info!(endpoint_id = %id, "Deleted webhook endpoint");
        Ok(removed)
    }

    /// Endpoints visible to the actor, oldest first
    pub async fn list(&self, actor: &Actor) -> Vec<Endpoint> {
        let endpoints = self.endpoints.read().await;
        let mut visible: Vec<Endpoint> = endpoints
            .values()
            .filter(|e| actor.can_manage(e))
            .cloned()
            .collect();
        visible.sort_by_key(|e| e.created_at);
        visible
    }

    /// Active endpoints subscribed to `event`
    pub async fn subscribers(&self, event: &str) -> Vec<Endpoint> {
        let endpoints = self.endpoints.read().await;
        endpoints.values().filter(|e| e.accepts(event)).cloned().collect()
    }
}
