//! Per-unit write path and run reports.

use std::sync::Arc;

use bulk_loader_repository::{BulkItemOutcome, SearchTransport};
use bulk_loader_shared::{BulkAction, RecordBatch};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::lifecycle::LifecycleState;
use super::run_state::RunState;
use crate::config::Mode;
use crate::errors::LoaderError;
use crate::loader::{BatchAccumulator, BulkDispatcher};
use crate::processor::{DocumentTransformer, IdentityResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterStatus {
    Open,
    Finished,
    Aborted,
    Committed,
}

/// Writes the record batches of one processing unit.
///
/// Each unit owns its accumulator and dispatcher; the only state shared with
/// other units is the [`RunState`].
pub struct UnitWriter {
    unit: usize,
    transformer: Arc<DocumentTransformer>,
    resolver: Arc<IdentityResolver>,
    accumulator: BatchAccumulator,
    dispatcher: BulkDispatcher,
    run: Arc<RunState>,
    records: u64,
    status: WriterStatus,
}

impl UnitWriter {
    pub(crate) fn new(
        unit: usize,
        transformer: Arc<DocumentTransformer>,
        resolver: Arc<IdentityResolver>,
        transport: Arc<dyn SearchTransport>,
        run: Arc<RunState>,
    ) -> Self {
        let accumulator = BatchAccumulator::new(
            run.batch_limits(),
            run.generation(),
            run.doc_type().map(str::to_string),
            run.sequence(),
        );
        let dispatcher = BulkDispatcher::new(transport, Arc::clone(&run));
        Self {
            unit,
            transformer,
            resolver,
            accumulator,
            dispatcher,
            run,
            records: 0,
            status: WriterStatus::Open,
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    fn ensure_open(&self) -> Result<(), LoaderError> {
        if self.status != WriterStatus::Open {
            return Err(LoaderError::writer(format!(
                "unit {} is {:?}",
                self.unit, self.status
            )));
        }
        Ok(())
    }

    /// Transform a batch of records and queue them for sending.
    ///
    /// May wait for the run's dispatch budget. A failure aborts the run and
    /// waits for this unit's requests in flight before returning.
    #[instrument(skip(self, batch), fields(unit = self.unit, records = batch.len()))]
    pub async fn add(&mut self, batch: &RecordBatch) -> Result<(), LoaderError> {
        self.ensure_open()?;
        for record in batch.records() {
            if let Err(e) = self.run.ensure_active() {
                return Err(self.fail(e).await);
            }
            let document = self.transformer.transform(record);
            let identity = self.resolver.resolve(record);
            self.records += 1;

            if let Some(sealed) = self.accumulator.append(BulkAction::new(document, identity)) {
                if let Err(e) = self.dispatcher.dispatch(sealed).await {
                    return Err(self.fail(e).await);
                }
            }
        }
        Ok(())
    }

    /// Send the last partial batch and wait for every request of this unit.
    #[instrument(skip(self), fields(unit = self.unit))]
    pub async fn finish(&mut self) -> Result<(), LoaderError> {
        self.ensure_open()?;
        if let Some(sealed) = self.accumulator.finish() {
            if let Err(e) = self.dispatcher.dispatch(sealed).await {
                return Err(self.fail(e).await);
            }
        }
        if let Err(e) = self.dispatcher.drain().await {
            return Err(self.fail(e).await);
        }
        self.status = WriterStatus::Finished;
        debug!(records = self.records, "Unit finished");
        Ok(())
    }

    /// Stop this unit and the run. Requests already in flight are awaited.
    pub async fn abort(&mut self) {
        if matches!(self.status, WriterStatus::Aborted | WriterStatus::Committed) {
            return;
        }
        info!(unit = self.unit, "Aborting unit");
        self.run.abort();
        if let Err(e) = self.dispatcher.drain().await {
            debug!(unit = self.unit, error = %e, "Bulk failure while aborting");
        }
        self.status = WriterStatus::Aborted;
    }

    /// Report of a finished unit.
    pub fn commit(&mut self) -> Result<UnitReport, LoaderError> {
        if self.status != WriterStatus::Finished {
            return Err(LoaderError::writer(format!(
                "unit {} cannot commit while {:?}",
                self.unit, self.status
            )));
        }
        self.status = WriterStatus::Committed;

        let stats = self.dispatcher.stats();
        Ok(UnitReport {
            unit: self.unit,
            records: self.records,
            actions: stats.actions,
            batches: stats.batches,
            failed_actions: stats.failed_actions,
            retries: stats.retries,
            failures: self.dispatcher.take_failures(),
        })
    }

    async fn fail(&mut self, error: LoaderError) -> LoaderError {
        warn!(unit = self.unit, error = %error, "Unit failed");
        self.abort().await;
        error
    }
}

/// Totals of one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: usize,
    pub records: u64,
    pub actions: u64,
    pub batches: u64,
    pub failed_actions: u64,
    pub retries: u64,
    /// Every item the engine rejected.
    pub failures: Vec<BulkItemOutcome>,
}

/// Totals of a committed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub generation: String,
    pub alias: Option<String>,
    pub units: usize,
    pub records: u64,
    pub actions: u64,
    pub batches: u64,
    pub failed_actions: u64,
    pub retries: u64,
    pub peak_in_flight: usize,
    /// Retired generations that were deleted after the swap.
    pub deleted: Vec<String>,
    pub failures: Vec<BulkItemOutcome>,
}

impl RunReport {
    pub(crate) fn aggregate(generation: &str, alias: Option<&str>, units: Vec<UnitReport>) -> Self {
        let mut report = RunReport {
            generation: generation.to_string(),
            alias: alias.map(str::to_string),
            units: units.len(),
            ..RunReport::default()
        };
        for unit in units {
            report.records += unit.records;
            report.actions += unit.actions;
            report.batches += unit.batches;
            report.failed_actions += unit.failed_actions;
            report.retries += unit.retries;
            report.failures.extend(unit.failures);
        }
        report
    }

    pub fn succeeded_actions(&self) -> u64 {
        self.actions.saturating_sub(self.failed_actions)
    }
}

/// Everything needed to resume or clean up a run from another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitState {
    pub index: String,
    pub alias: Option<String>,
    pub generation: String,
    pub mode: Mode,
    pub state: LifecycleState,
    /// Generations the alias pointed at when the run started.
    #[serde(default)]
    pub retired: Vec<String>,
}
