//! Periodic retry sweep
//!
//! Picks up events whose backoff deadline has passed plus events whose live
//! dispatch never ran, and dispatches each one. A failing event is counted
//! and logged; it never stops the rest of the batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::webhooks::dispatcher::{DispatchOutcome, WebhookDispatcher};

pub const DEFAULT_STRANDED_AFTER: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_BATCH: i64 = 100;

/// Totals for one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub stranded: usize,
    pub processed: usize,
    pub unhandled: usize,
    pub failed: usize,
    pub exhausted: usize,
    /// Dispatch itself errored (store unavailable, row vanished)
    pub errors: usize,
}

impl SweepReport {
    pub fn attempted(&self) -> usize {
        self.due + self.stranded
    }

    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Processed => self.processed += 1,
            DispatchOutcome::Unhandled => self.unhandled += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Exhausted { .. } => self.exhausted += 1,
            DispatchOutcome::AlreadyProcessed => {}
        }
    }
}

pub struct RetrySweeper {
    dispatcher: Arc<WebhookDispatcher>,
    stranded_after: Duration,
    batch_size: i64,
}

impl RetrySweeper {
    pub fn new(dispatcher: Arc<WebhookDispatcher>, stranded_after: Duration, batch_size: i64) -> Self {
        Self {
            dispatcher,
            stranded_after,
            batch_size,
        }
    }

    pub async fn run_once(&self) -> BillingResult<SweepReport> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_at(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let due = self
            .dispatcher
            .scheduler()
            .due_for_retry(now, self.batch_size)
            .await?;

        let stranded_before = now - self.stranded_after;
        let mut seen: HashSet<Uuid> = due.iter().copied().collect();
        let stranded: Vec<Uuid> = self
            .dispatcher
            .store()
            .stranded(stranded_before, self.batch_size)
            .await?
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();

        let mut report = SweepReport {
            due: due.len(),
            stranded: stranded.len(),
            ..SweepReport::default()
        };

        if report.attempted() == 0 {
            tracing::debug!("Webhook sweep found nothing to do");
            return Ok(report);
        }

        if !stranded.is_empty() {
            tracing::warn!(
                count = stranded.len(),
                "Recovering webhook events whose live dispatch never ran"
            );
        }

        for event_id in due.into_iter().chain(stranded) {
            match self.dispatcher.dispatch_at(event_id, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        event_id = %event_id,
                        error = %e,
                        "Webhook sweep failed to dispatch event"
                    );
                }
            }
        }

        tracing::info!(
            due = report.due,
            stranded = report.stranded,
            processed = report.processed,
            unhandled = report.unhandled,
            failed = report.failed,
            exhausted = report.exhausted,
            errors = report.errors,
            "Webhook retry sweep complete"
        );

        Ok(report)
    }
}
