//! Bulk dispatch with bounded concurrency and retries.
//!
//! Each sealed batch is sent from its own task. A task first takes a slot
//! from the run-wide budget in [`RunState`]; when none is free the producing
//! unit waits, which is the backpressure on the input side.
//!
//! Transport failures (connection errors, timeouts, 5xx and 429) retry the
//! whole batch with doubling backoff. Items the engine rejects inside an
//! accepted request are logged and counted, never retried.

use std::sync::Arc;

use bulk_loader_repository::{BulkItemOutcome, BulkResponse, SearchEngineError, SearchTransport};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_retry::RetryIf;
use tracing::{debug, instrument, warn};

use super::accumulator::BulkBatch;
use super::retry::RetryPolicy;
use crate::errors::LoaderError;
use crate::orchestrator::RunState;

/// Result of one delivered batch.
#[derive(Debug, Clone)]
pub struct BulkOutcome {
    pub sequence: u64,
    pub actions: usize,
    /// Requests sent, including the successful one.
    pub attempts: usize,
    pub response: BulkResponse,
}

impl BulkOutcome {
    /// Whether every action of the batch succeeded.
    pub fn is_success(&self) -> bool {
        !self.response.has_failures()
    }

    pub fn failed_count(&self) -> usize {
        self.response.failed_count()
    }
}

/// Counters for the batches one dispatcher has settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub batches: u64,
    pub actions: u64,
    pub failed_actions: u64,
    pub retries: u64,
}

/// Send one batch, retrying transport failures per `policy`.
///
/// # Returns
///
/// * `Ok(BulkOutcome)` - The engine accepted the request; items may still have failed
/// * `Err(LoaderError::RetriesExhausted)` - Every attempt hit a retryable failure
/// * `Err(LoaderError::Transport)` - The engine rejected the request as a whole
pub async fn send_batch(
    transport: &dyn SearchTransport,
    index: &str,
    doc_type: Option<&str>,
    batch: &BulkBatch,
    policy: &RetryPolicy,
) -> Result<BulkOutcome, LoaderError> {
    let sequence = batch.sequence();
    let request_timeout = policy.request_timeout;
    let mut attempts = 0usize;

    let attempt = || {
        attempts += 1;
        let attempt = attempts;
        async move {
            debug!(
                sequence = sequence,
                attempt = attempt,
                actions = batch.len(),
                bytes = batch.estimated_bytes(),
                "Executing bulk actions"
            );
            let result = match timeout(
                request_timeout,
                transport.bulk(index, doc_type, batch.actions()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SearchEngineError::timeout(format!(
                    "bulk request exceeded {:?}",
                    request_timeout
                ))),
            };
            if let Err(e) = &result {
                warn!(
                    sequence = sequence,
                    attempt = attempt,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Bulk request failed"
                );
            }
            result
        }
    };

    let result = RetryIf::spawn(policy.delays(), attempt, |e: &SearchEngineError| {
        e.is_retryable()
    })
    .await;

    match result {
        Ok(response) => Ok(BulkOutcome {
            sequence,
            actions: batch.len(),
            attempts,
            response,
        }),
        Err(e) if e.is_retryable() => Err(LoaderError::RetriesExhausted {
            sequence,
            attempts: attempts as u32,
            source: e,
        }),
        Err(e) => Err(LoaderError::Transport(e)),
    }
}

/// Sends the batches of one unit.
///
/// Batches are spawned in submission order and may complete in any order.
/// Completed batches are settled on the next [`dispatch`](Self::dispatch)
/// and on [`drain`](Self::drain).
pub struct BulkDispatcher {
    transport: Arc<dyn SearchTransport>,
    run: Arc<RunState>,
    tasks: JoinSet<Result<BulkOutcome, LoaderError>>,
    stats: DispatchStats,
    failures: Vec<BulkItemOutcome>,
}

impl BulkDispatcher {
    pub fn new(transport: Arc<dyn SearchTransport>, run: Arc<RunState>) -> Self {
        Self {
            transport,
            run,
            tasks: JoinSet::new(),
            stats: DispatchStats::default(),
            failures: Vec::new(),
        }
    }

    /// Hand a batch over for sending.
    ///
    /// Waits for a free slot of the run budget. In synchronous mode the
    /// batch is settled before returning.
    ///
    /// # Returns
    ///
    /// * `Err(LoaderError)` - If the run was aborted or an earlier batch of
    ///   this unit failed fatally
    #[instrument(skip(self, batch), fields(sequence = batch.sequence(), actions = batch.len()))]
    pub async fn dispatch(&mut self, batch: BulkBatch) -> Result<(), LoaderError> {
        self.run.ensure_active()?;
        self.reap()?;

        let slot = self.run.acquire_slot().await?;
        let transport = Arc::clone(&self.transport);
        let run = Arc::clone(&self.run);
        self.tasks.spawn(async move {
            let _slot = slot;
            send_batch(
                transport.as_ref(),
                run.generation(),
                run.doc_type(),
                &batch,
                run.retry_policy(),
            )
            .await
        });

        if self.run.synchronous() {
            self.drain().await?;
        }
        Ok(())
    }

    /// Wait for every batch in flight and settle it.
    ///
    /// All tasks are awaited even after a failure; the first failure is
    /// returned and aborts the run.
    pub async fn drain(&mut self) -> Result<(), LoaderError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let settled = joined
                .map_err(LoaderError::from)
                .and_then(|result| result)
                .and_then(|outcome| self.settle(outcome));
            if let Err(e) = settled {
                if first_error.is_none() {
                    self.run.abort();
                    first_error = Some(e);
                } else {
                    debug!(error = %e, "Further bulk failure while draining");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of batches spawned but not yet settled.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Items the engine rejected so far.
    pub fn failures(&self) -> &[BulkItemOutcome] {
        &self.failures
    }

    pub fn take_failures(&mut self) -> Vec<BulkItemOutcome> {
        std::mem::take(&mut self.failures)
    }

    /// Settle batches that already completed without waiting.
    fn reap(&mut self) -> Result<(), LoaderError> {
        while let Some(joined) = self.tasks.try_join_next() {
            let settled = joined
                .map_err(LoaderError::from)
                .and_then(|result| result)
                .and_then(|outcome| self.settle(outcome));
            if let Err(e) = settled {
                self.run.abort();
                return Err(e);
            }
        }
        Ok(())
    }

    fn settle(&mut self, outcome: BulkOutcome) -> Result<(), LoaderError> {
        self.stats.batches += 1;
        self.stats.actions += outcome.actions as u64;
        self.stats.retries += outcome.attempts.saturating_sub(1) as u64;

        if outcome.is_success() {
            debug!(
                sequence = outcome.sequence,
                actions = outcome.actions,
                took_millis = ?outcome.response.took_millis,
                "Bulk batch delivered"
            );
            return Ok(());
        }

        for item in outcome.response.failures() {
            let (kind, reason) = item
                .failure
                .as_ref()
                .map(|f| (f.kind.as_str(), f.reason.as_str()))
                .unwrap_or(("status", ""));
            debug!(
                index = ?item.index,
                doc_type = ?item.doc_type,
                id = ?item.id,
                operation = %item.operation,
                status = item.status,
                kind = kind,
                reason = reason,
                "Bulk action failed"
            );
        }

        let failed = outcome.failed_count() as u64;
        warn!(
            sequence = outcome.sequence,
            failed = failed,
            actions = outcome.actions,
            "Bulk batch completed with failed actions"
        );
        self.stats.failed_actions += failed;
        self.failures.extend(outcome.response.failures().cloned());
        self.run.record_failures(failed)
    }
}
