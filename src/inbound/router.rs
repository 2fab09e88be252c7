// Inbound event dispatch table
//
// Maps event-type patterns to handlers. The most specific pattern wins:
// an exact match beats any prefix, and a longer prefix beats a shorter one.
// Events nothing matches go to the fallback handler.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use axum::http::StatusCode;

use super::InboundEvent;

/// Routing result reported back to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundStatus {
    /// Handled synchronously
    Ok,
    /// Accepted and handed to a background handler
    Received,
    /// No handler for this event type
    UnknownEvent,
    /// A handler exists but cannot take work right now
    Unavailable,
}

impl InboundStatus {
    pub fn http_status(self) -> StatusCode {
        match self {
            InboundStatus::Ok => StatusCode::OK,
            InboundStatus::Received => StatusCode::ACCEPTED,
            InboundStatus::UnknownEvent => StatusCode::UNPROCESSABLE_ENTITY,
            InboundStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InboundStatus::Ok => "ok",
            InboundStatus::Received => "received",
            InboundStatus::UnknownEvent => "unknown_event",
            InboundStatus::Unavailable => "unavailable",
        }
    }
}

/// What a handler did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub status: InboundStatus,
    pub message: String,
}

impl HandlerOutcome {
    pub fn new(status: InboundStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Event handler; must not block, long work is deferred
pub type Handler = Arc<dyn Fn(&InboundEvent) -> HandlerOutcome + Send + Sync>;

/// Event-type pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    Exact(String),
    Prefix(String),
}

impl EventPattern {
    pub fn exact(event: impl Into<String>) -> Self {
        EventPattern::Exact(event.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        EventPattern::Prefix(prefix.into())
    }

    /// Match specificity, `None` if the pattern does not match
    fn specificity(&self, event: &str) -> Option<usize> {
        match self {
            EventPattern::Exact(e) if e == event => Some(usize::MAX),
            EventPattern::Prefix(p) if event.starts_with(p.as_str()) => Some(p.len()),
            _ => None,
        }
    }
}

/// Registerable dispatch table
#[derive(Clone)]
pub struct EventRouter {
    routes: Vec<(EventPattern, Handler)>,
    fallback: Handler,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    /// Empty table whose fallback rejects every event as unknown
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            fallback: Arc::new(|event: &InboundEvent| {
                HandlerOutcome::new(
                    InboundStatus::UnknownEvent,
                    format!("Unknown event type: {}", event.event),
                )
            }),
        }
    }

    /// Register a handler; a later registration of the same pattern replaces the earlier one
    pub fn route<F>(mut self, pattern: EventPattern, handler: F) -> Self
    where
        F: Fn(&InboundEvent) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn register<F>(&mut self, pattern: EventPattern, handler: F)
    where
        F: Fn(&InboundEvent) -> HandlerOutcome + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        match self.routes.iter_mut().find(|(p, _)| *p == pattern) {
            Some(route) => route.1 = handler,
            None => self.routes.push((pattern, handler)),
        }
    }

    /// Replace the handler for unmatched events
    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InboundEvent) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.fallback = Arc::new(handler);
        self
    }

    /// Route one event to its most specific handler
    pub fn dispatch(&self, event: &InboundEvent) -> HandlerOutcome {
        let handler = self
            .routes
            .iter()
            .filter_map(|(pattern, handler)| {
                pattern.specificity(&event.event).map(|rank| (rank, pattern, handler))
            })
            .max_by_key(|(rank, _, _)| *rank);

        match handler {
            Some((_, pattern, handler)) => {
                debug!(event = %event.event, ?pattern, "Routing inbound event");
                handler(event)
            }
            None => (self.fallback)(event),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("routes", &self.routes.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str) -> InboundEvent {
        InboundEvent::new(name, json!({}))
    }

    fn tagged(tag: &'static str) -> impl Fn(&InboundEvent) -> HandlerOutcome {
        move |_| HandlerOutcome::new(InboundStatus::Ok, tag)
    }

    #[test]
    fn test_unmatched_goes_to_fallback() {
        let router = EventRouter::new();
        let outcome = router.dispatch(&event("foo.bar"));
        assert_eq!(outcome.status, InboundStatus::UnknownEvent);
        assert!(outcome.message.contains("foo.bar"));
    }

    #[test]
    fn test_exact_beats_prefix() {
        let router = EventRouter::new()
            .route(EventPattern::prefix("sync."), tagged("prefix"))
            .route(EventPattern::exact("sync.special"), tagged("exact"));

        assert_eq!(router.dispatch(&event("sync.special")).message, "exact");
        assert_eq!(router.dispatch(&event("sync.community")).message, "prefix");
    }

    #[test]
    fn test_longer_prefix_wins() {
        let router = EventRouter::new()
            .route(EventPattern::prefix("sync.community."), tagged("long"))
            .route(EventPattern::prefix("sync."), tagged("short"));

        assert_eq!(router.dispatch(&event("sync.community.updated")).message, "long");
        assert_eq!(router.dispatch(&event("sync.post")).message, "short");
    }

    #[test]
    fn test_exact_does_not_match_prefixes() {
        let router = EventRouter::new().route(EventPattern::exact("ping"), tagged("ping"));
        assert_eq!(router.dispatch(&event("pingx")).status, InboundStatus::UnknownEvent);
        assert_eq!(router.dispatch(&event("ping")).message, "ping");
    }

    #[test]
    fn test_register_replaces_same_pattern() {
        let mut router = EventRouter::new();
        router.register(EventPattern::exact("ping"), tagged("old"));
        router.register(EventPattern::exact("ping"), tagged("new"));

        assert_eq!(router.len(), 1);
        assert_eq!(router.dispatch(&event("ping")).message, "new");
    }

    #[test]
    fn test_custom_fallback() {
        let router = EventRouter::new()
            .fallback(|_| HandlerOutcome::new(InboundStatus::Received, "ignored"));
        assert_eq!(router.dispatch(&event("anything")).status, InboundStatus::Received);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(InboundStatus::Ok.http_status(), StatusCode::OK);
        assert_eq!(InboundStatus::Received.http_status(), StatusCode::ACCEPTED);
        assert_eq!(InboundStatus::UnknownEvent.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(InboundStatus::Unavailable.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            serde_json::to_value(InboundStatus::UnknownEvent).unwrap(),
            json!("unknown_event")
        );
    }
}
