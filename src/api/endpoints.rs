// Endpoint management handlers
//
// Reads need any scope, mutations need `write`. The signing secret appears
// only in the create response.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::error::WebhookResult;
use crate::webhooks::delivery::{Delivery, DeliveryStatus};
use crate::webhooks::endpoint::{Endpoint, EndpointUpdate, NewEndpoint};

use super::auth::{Principal, Scope};
use super::{parse_json, AppState, Data};

/// Create response: the endpoint plus its secret, shown this once
#[derive(Debug, Serialize)]
pub struct CreatedEndpoint {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub secret: String,
}

/// Test trigger response
#[derive(Debug, Serialize)]
pub struct TestQueued {
    pub status: &'static str,
    pub delivery_id: Uuid,
}

/// Delivery as reported to its owner
#[derive(Debug, Serialize)]
pub struct DeliveryView {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub delivered_at: Option<chrono::DateTime<chrono::Utc>>,
    pub next_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Delivery> for DeliveryView {
    fn from(d: Delivery) -> Self {
        Self {
            id: d.id,
            endpoint_id: d.endpoint_id,
            event: d.event,
            status: d.status,
            attempts: d.attempts,
            response_code: d.response_code,
            response_body: d.response_body,
            delivered_at: d.delivered_at,
            next_attempt_at: d.next_attempt_at,
            created_at: d.created_at,
        }
    }
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    body: Bytes,
) -> WebhookResult<(StatusCode, Json<Data<CreatedEndpoint>>)> {
    principal.require(Scope::Write)?;
    let new: NewEndpoint = parse_json(&body)?;

    let registered = state
        .manager
        .register_endpoint(&principal.actor(), new)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(Data::new(CreatedEndpoint {
            endpoint: registered.endpoint,
            secret: registered.secret,
        })),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
) -> WebhookResult<Json<Data<Vec<Endpoint>>>> {
    principal.require(Scope::Read)?;
    let endpoints = state.manager.list_endpoints(&principal.actor()).await;
    Ok(Json(Data::new(endpoints)))
}

pub async fn show(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> WebhookResult<Json<Data<Endpoint>>> {
    principal.require(Scope::Read)?;
    let endpoint = state.manager.endpoint(&principal.actor(), id).await?;
    Ok(Json(Data::new(endpoint)))
}

pub async fn update(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> WebhookResult<Json<Data<Endpoint>>> {
    principal.require(Scope::Write)?;
    let update: EndpointUpdate = parse_json(&body)?;
    let endpoint = state
        .manager
        .update_endpoint(&principal.actor(), id, update)
        .await?;
    Ok(Json(Data::new(endpoint)))
}

pub async fn deactivate(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> WebhookResult<Json<Data<Endpoint>>> {
    principal.require(Scope::Write)?;
    let endpoint = state
        .manager
        .deactivate_endpoint(&principal.actor(), id)
        .await?;
    Ok(Json(Data::new(endpoint)))
}

pub async fn delete(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> WebhookResult<StatusCode> {
    principal.require(Scope::Write)?;
    state.manager.delete_endpoint(&principal.actor(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trigger_test(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> WebhookResult<(StatusCode, Json<TestQueued>)> {
    principal.require(Scope::Write)?;
    let delivery = state.manager.trigger_test(&principal.actor(), id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TestQueued {
            status: "queued",
            delivery_id: delivery.id,
        }),
    ))
}

pub async fn deliveries(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> WebhookResult<Json<Data<Vec<DeliveryView>>>> {
    principal.require(Scope::Read)?;
    let deliveries = state
        .manager
        .deliveries_for(&principal.actor(), id)
        .await?
        .into_iter()
        .map(DeliveryView::from)
        .collect();
    Ok(Json(Data::new(deliveries)))
}

pub async fn delivery(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> WebhookResult<Json<Data<DeliveryView>>> {
    principal.require(Scope::Read)?;
    let delivery = state.manager.delivery(&principal.actor(), id).await?;
    Ok(Json(Data::new(delivery.into())))
}
