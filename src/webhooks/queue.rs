// Delivery task queue and worker pool
//
// At-least-once: a delivery id may be handed to the dispatcher more than
// once, which is safe because dispatching a terminal delivery is a no-op.
// Retries are re-enqueued with a delay, never dispatched recursively.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{WebhookError, WebhookResult};
use crate::webhooks::dispatcher::{DispatchOutcome, Dispatcher};

/// Producer side of the delivery queue
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Uuid>,
}

/// Consumer side of the delivery queue, owned by the worker pool
#[derive(Debug)]
pub struct DeliveryReceiver {
    rx: mpsc::UnboundedReceiver<Uuid>,
}

impl DeliveryReceiver {
    /// Next queued delivery id
    pub async fn recv(&mut self) -> Option<Uuid> {
        self.rx.recv().await
    }
}

impl DeliveryQueue {
    /// Create a queue and its receiver
    pub fn new() -> (Self, DeliveryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DeliveryReceiver { rx })
    }

    /// Enqueue a delivery for immediate dispatch
    pub fn enqueue(&self, delivery_id: Uuid) -> WebhookResult<()> {
        self.tx.send(delivery_id).map_err(|_| WebhookError::QueueClosed)
    }

    /// Enqueue a delivery once `delay` has elapsed
    pub fn enqueue_in(&self, delivery_id: Uuid, delay: Duration) {
        if delay.is_zero() {
            if self.enqueue(delivery_id).is_err() {
                warn!(delivery_id = %delivery_id, "Queue closed, dropping retry");
            }
            return;
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(delivery_id).is_err() {
                warn!(delivery_id = %delivery_id, "Queue closed, dropping retry");
            }
        });
    }
}

/// Handle to a running worker pool
pub struct WorkerPool {
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Start consuming `receiver`, running at most `concurrency` dispatches at once
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        queue: DeliveryQueue,
        mut receiver: DeliveryReceiver,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        info!("Starting delivery worker pool ({} workers)", concurrency);

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let handle = tokio::spawn(async move {
            while let Some(delivery_id) = receiver.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let dispatcher = dispatcher.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_job(dispatcher, &queue, delivery_id).await;
                });
            }
            debug!("Delivery queue drained, worker pool exiting");
        });

        Self { handle }
    }

    /// Stop accepting new jobs; in-flight dispatches finish on their own
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Dispatch one delivery and schedule its retry if needed
pub async fn run_job(dispatcher: Arc<Dispatcher>, queue: &DeliveryQueue, delivery_id: Uuid) {
    // Run the dispatch in its own task so a panic surfaces as a JoinError
    // instead of killing the worker.
    let task = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(delivery_id).await })
    };

    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(delivery_id = %delivery_id, error = %e, "Dispatch task crashed");
            dispatcher
                .record_crash(delivery_id, &format!("dispatch crashed: {}", e))
                .await
        }
    };

    match outcome {
        Ok(DispatchOutcome::Retry(delay)) => {
            debug!(
                delivery_id = %delivery_id,
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );
            queue.enqueue_in(delivery_id, delay);
        }
        Ok(outcome) => {
            debug!(delivery_id = %delivery_id, ?outcome, "Dispatch finished");
        }
        Err(e) => {
            warn!(delivery_id = %delivery_id, error = %e, "Dispatch rejected");
        }
    }
}
