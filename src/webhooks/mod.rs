// Outbound webhook delivery
//
// Handles:
// - Endpoint registration with per-endpoint signing secrets
// - Delivery records and their state machine
// - HMAC-SHA256 signing of each request
// - Dispatch on a worker pool with exponential backoff retries

pub mod delivery;
pub mod dispatcher;
pub mod endpoint;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod signer;

pub use delivery::{Delivery, DeliveryStatus, DeliveryStore};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use endpoint::{Actor, Endpoint, EndpointRegistry, EndpointUpdate, NewEndpoint};
pub use manager::WebhookManager;
pub use queue::{DeliveryQueue, WorkerPool};
pub use retry::{RetryDecision, RetryPolicy};
