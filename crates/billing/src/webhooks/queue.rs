//! Bounded dispatch queue
//!
//! The HTTP path enqueues an admitted event ID and returns. A single pump task
//! drains the channel and runs each dispatch on its own task, with a semaphore
//! capping how many handlers run at once. When the channel is full the event
//! is simply left in the store; stranded recovery in the sweep picks it up.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::webhooks::dispatcher::WebhookDispatcher;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 8;

/// Result of offering an event to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Channel full or pump stopped; the sweep will recover the event
    Deferred,
}

#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<Uuid>,
}

impl DispatchQueue {
    /// Spawn the pump. The returned handle completes once every sender is
    /// dropped and all in-flight dispatches have finished.
    pub fn start(
        dispatcher: Arc<WebhookDispatcher>,
        capacity: usize,
        concurrency: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(pump(dispatcher, receiver, concurrency.max(1)));
        (Self { sender }, handle)
    }

    pub fn enqueue(&self, event_id: Uuid) -> Enqueued {
        match self.sender.try_send(event_id) {
            Ok(()) => Enqueued::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    event_id = %event_id,
                    "Dispatch queue full - event left for stranded recovery"
                );
                Enqueued::Deferred
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!(
                    event_id = %event_id,
                    "Dispatch queue closed - event left for stranded recovery"
                );
                Enqueued::Deferred
            }
        }
    }
}

async fn pump(
    dispatcher: Arc<WebhookDispatcher>,
    mut receiver: mpsc::Receiver<Uuid>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(event_id) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let dispatcher = Arc::clone(&dispatcher);

        tokio::spawn(async move {
            let _permit = permit;
            match dispatcher.dispatch(event_id).await {
                Ok(outcome) => {
                    tracing::debug!(event_id = %event_id, outcome = ?outcome, "Live dispatch finished");
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        error = %e,
                        "Live dispatch failed - event left for the sweep"
                    );
                }
            }
        });
    }

    // Wait for in-flight dispatches before reporting shutdown
    let _ = permits.acquire_many(concurrency as u32).await;
    tracing::info!("Dispatch queue drained");
}
