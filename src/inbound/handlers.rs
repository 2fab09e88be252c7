// Built-in inbound handlers
//
// - `ping` answers inline
// - `sync.*` and `action.*` are acknowledged and queued for a DomainHandler
//
// The deferred queue is bounded; when it is full the sender gets 503 and is
// expected to retry.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::router::{EventPattern, EventRouter, HandlerOutcome, InboundStatus};
use super::InboundEvent;

/// Capacity of the deferred job channel
pub const DEFERRED_QUEUE_CAPACITY: usize = 1024;

/// How long shutdown waits for acknowledged jobs to finish
pub const DEFERRED_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Which background handler a deferred job goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Data sync from an external system
    Sync,
    /// Command to execute
    Action,
}

/// Inbound event waiting for its background handler
#[derive(Debug, Clone)]
pub struct DeferredJob {
    pub kind: JobKind,
    pub event: InboundEvent,
}

/// Domain side of deferred inbound events
#[async_trait]
pub trait DomainHandler: Send + Sync {
    /// Apply a `sync.*` event
    async fn sync(&self, event: &InboundEvent) -> anyhow::Result<()>;

    /// Execute an `action.*` event
    async fn action(&self, event: &InboundEvent) -> anyhow::Result<()>;
}

/// Handler that only logs; used until a real domain handler is plugged in
#[derive(Debug, Default)]
pub struct LoggingDomainHandler;

#[async_trait]
impl DomainHandler for LoggingDomainHandler {
    async fn sync(&self, event: &InboundEvent) -> anyhow::Result<()> {
        info!(event = %event.event, "Processing sync event");
        Ok(())
    }

    async fn action(&self, event: &InboundEvent) -> anyhow::Result<()> {
        info!(event = %event.event, "Processing action event");
        Ok(())
    }
}

/// Health check handler
pub fn ping(_event: &InboundEvent) -> HandlerOutcome {
    HandlerOutcome::new(InboundStatus::Ok, "pong")
}

/// Handler that queues the event for background processing
pub fn defer(
    kind: JobKind,
    sender: mpsc::Sender<DeferredJob>,
) -> impl Fn(&InboundEvent) -> HandlerOutcome + Send + Sync + 'static {
    move |event: &InboundEvent| {
        let job = DeferredJob {
            kind,
            event: event.clone(),
        };
        match sender.try_send(job) {
            Ok(()) => {
                debug!(event = %event.event, ?kind, "Deferred inbound event");
                HandlerOutcome::new(InboundStatus::Received, format!("{} queued", event.event))
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = %event.event, "Deferred queue full");
                HandlerOutcome::new(InboundStatus::Unavailable, "Handler busy, retry later")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(event = %event.event, "Deferred queue closed");
                HandlerOutcome::new(InboundStatus::Unavailable, "Handler unavailable")
            }
        }
    }
}

/// The standard table: `ping`, `sync.*`, `action.*`
pub fn default_router(sender: mpsc::Sender<DeferredJob>) -> EventRouter {
    EventRouter::new()
        .route(EventPattern::exact("ping"), ping)
        .route(EventPattern::prefix("sync."), defer(JobKind::Sync, sender.clone()))
        .route(EventPattern::prefix("action."), defer(JobKind::Action, sender))
}

/// Background task running deferred jobs
pub struct DeferredWorker {
    handle: JoinHandle<usize>,
    stop: Arc<Notify>,
}

impl DeferredWorker {
    /// Wait for the worker to finish every queued job
    ///
    /// The senders must already be dropped. Jobs still queued or running
    /// after `grace` are discarded; returns how many.
    pub async fn drain(mut self, grace: Duration) -> usize {
        if let Ok(result) = tokio::time::timeout(grace, &mut self.handle).await {
            return joined(result);
        }
        self.stop.notify_one();
        joined(self.handle.await)
    }
}

fn joined(result: Result<usize, tokio::task::JoinError>) -> usize {
    result.unwrap_or_else(|e| {
        error!(error = %e, "Deferred worker crashed");
        0
    })
}

async fn run_job<H: DomainHandler>(handler: &H, job: &DeferredJob) {
    let result = match job.kind {
        JobKind::Sync => handler.sync(&job.event).await,
        JobKind::Action => handler.action(&job.event).await,
    };
    if let Err(e) = result {
        error!(
            event = %job.event.event,
            kind = ?job.kind,
            error = %e,
            "Deferred handler failed"
        );
    }
}

/// Drain deferred jobs into `handler` until every sender is dropped
pub fn spawn_deferred_worker<H>(
    mut receiver: mpsc::Receiver<DeferredJob>,
    handler: H,
) -> DeferredWorker
where
    H: DomainHandler + 'static,
{
    let stop = Arc::new(Notify::new());
    let stopped = stop.clone();

    let handle = tokio::spawn(async move {
        let mut dropped = 0;
        loop {
            let job = tokio::select! {
                _ = stopped.notified() => break,
                job = receiver.recv() => job,
            };
            let Some(job) = job else {
                debug!("Deferred job channel closed, worker exiting");
                return 0;
            };
            tokio::select! {
                _ = stopped.notified() => {
                    dropped = 1;
                    break;
                }
                _ = run_job(&handler, &job) => {}
            }
        }

        receiver.close();
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    });

    DeferredWorker { handle, stop }
}
