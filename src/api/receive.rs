// Inbound receiver handler
//
// POST /webhooks/receive with `{event, payload}`. The event is routed through
// the dispatch table and the routing result is echoed back.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::{WebhookError, WebhookResult};
use crate::inbound::{InboundEvent, InboundStatus};
use crate::metrics;

use super::auth::{Principal, Scope};
use super::{AppState, Data};

#[derive(Debug, Serialize)]
pub struct WebhookResultBody {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub attributes: WebhookResultAttributes,
}

#[derive(Debug, Serialize)]
pub struct WebhookResultAttributes {
    pub event: String,
    pub status: InboundStatus,
    pub message: String,
}

pub async fn receive(
    State(state): State<AppState>,
    principal: Principal,
    body: Bytes,
) -> WebhookResult<Response> {
    principal.require(Scope::Write)?;

    let event = parse_event(&body)?;
    let outcome = state.inbound.dispatch(&event);
    metrics::record_inbound(outcome.status.as_str());
    info!(
        event = %event.event,
        status = outcome.status.as_str(),
        subject = %principal.subject,
        "Inbound webhook processed"
    );

    let body = Data::new(WebhookResultBody {
        kind: "webhook_result",
        attributes: WebhookResultAttributes {
            event: event.event,
            status: outcome.status,
            message: outcome.message,
        },
    });
    Ok((outcome.status.http_status(), Json(body)).into_response())
}

/// Parse `{event, payload}`; `payload` defaults to an empty object
fn parse_event(body: &[u8]) -> WebhookResult<InboundEvent> {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(body)
            .map_err(|e| WebhookError::validation("Invalid JSON", e.to_string()))?
    };

    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            WebhookError::validation(
                "Missing event type",
                "Request body must include an 'event' string",
            )
        })?
        .to_string();

    let payload = match value.get("payload") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(payload @ Value::Object(_)) => payload.clone(),
        Some(_) => {
            return Err(WebhookError::validation(
                "Invalid payload",
                "'payload' must be a JSON object",
            ))
        }
    };

    Ok(InboundEvent::new(event, payload))
}
