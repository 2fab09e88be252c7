//! hookrelay
//!
//! Signed outbound webhook delivery with bounded retries, plus an inbound
//! receiver that routes events through a registerable dispatch table.

pub mod api;
pub mod config;
pub mod error;
pub mod inbound;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod webhooks;

pub use error::{WebhookError, WebhookResult};
