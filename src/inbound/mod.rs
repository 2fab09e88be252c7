// Inbound webhook reception
//
// Events POSTed to the receiver are routed through a registerable dispatch
// table. Cheap events are answered inline; everything else is acknowledged
// and handed to a background domain handler.

pub mod handlers;
pub mod router;

use serde::{Deserialize, Serialize};

pub use handlers::{
    default_router, spawn_deferred_worker, DeferredJob, DeferredWorker, DomainHandler, JobKind,
};
pub use router::{EventPattern, EventRouter, HandlerOutcome, InboundStatus};

/// An event received from an external sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

impl InboundEvent {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}
