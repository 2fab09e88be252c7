//! Error types for the webhook layer.
//!
//! Every variant maps onto one HTTP status so API handlers can return
//! `Result<_, WebhookError>` directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

use crate::webhooks::delivery::DeliveryStatus;

/// Error variants for the webhook layer
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Malformed or missing input
    #[error("{title}: {detail}")]
    Validation { title: String, detail: String },

    /// No credential, or a credential we do not recognise
    #[error("Authentication required")]
    Unauthenticated,

    /// Authenticated but not allowed to touch this resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown endpoint id
    #[error("Webhook endpoint {0} not found")]
    EndpointNotFound(Uuid),

    /// Unknown delivery id
    #[error("Webhook delivery {0} not found")]
    DeliveryNotFound(Uuid),

    /// Attempted a move the delivery state machine does not allow
    #[error("Illegal delivery transition from {from} to {to}")]
    IllegalTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// The delivery queue is gone (worker pool shut down)
    #[error("Delivery queue closed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    /// Shorthand for a validation error
    pub fn validation(title: impl Into<String>, detail: impl Into<String>) -> Self {
        WebhookError::Validation {
            title: title.into(),
            detail: detail.into(),
        }
    }

    /// HTTP status this error is reported with
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            WebhookError::Unauthenticated => StatusCode::UNAUTHORIZED,
            WebhookError::Forbidden(_) => StatusCode::FORBIDDEN,
            WebhookError::EndpointNotFound(_) | WebhookError::DeliveryNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            WebhookError::IllegalTransition { .. } => StatusCode::CONFLICT,
            WebhookError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> String {
        match self {
            WebhookError::Validation { title, .. } => title.clone(),
            WebhookError::Unauthenticated => "Unauthorized".to_string(),
            WebhookError::Forbidden(_) => "Forbidden".to_string(),
            WebhookError::EndpointNotFound(_) | WebhookError::DeliveryNotFound(_) => {
                "Not found".to_string()
            }
            WebhookError::IllegalTransition { .. } => "Conflict".to_string(),
            WebhookError::QueueClosed => "Service unavailable".to_string(),
            WebhookError::Internal(_) => "Internal server error".to_string(),
        }
    }

    fn detail(&self) -> String {
        match self {
            WebhookError::Validation { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

/// One entry of a JSON:API `errors` array
#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub status: String,
    pub title: String,
    pub detail: String,
}

/// JSON:API error document
#[derive(Debug, Serialize)]
pub struct ErrorDocument {
    pub errors: Vec<ErrorObject>,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorDocument {
            errors: vec![ErrorObject {
                status: status.as_u16().to_string(),
                title: self.title(),
                detail: self.detail(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type WebhookResult<T> = Result<T, WebhookError>;
