//! State shared by every unit of one transaction.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::config::LoaderConfig;
use crate::errors::{ConfigError, LoaderError};
use crate::loader::{BatchLimits, BatchSequence, RetryPolicy};

/// Run-wide budgets and counters.
///
/// Units only share this value. Counters are atomics and the concurrency
/// budget is a semaphore, so any number of units can use it at once.
#[derive(Debug)]
pub struct RunState {
    generation: String,
    alias: Option<String>,
    doc_type: Option<String>,
    limits: BatchLimits,
    policy: RetryPolicy,
    synchronous: bool,
    budget: usize,
    slots: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    failed_actions: AtomicU64,
    max_failed_actions: Option<u64>,
    aborted: AtomicBool,
    sequence: BatchSequence,
}

impl RunState {
    /// Create the state for a run writing into `generation`.
    pub fn new(config: &LoaderConfig, generation: impl Into<String>) -> Result<Self, ConfigError> {
        let budget = config.dispatch_budget();
        Ok(Self {
            generation: generation.into(),
            alias: config.alias_name().map(str::to_string),
            doc_type: config.index_type.clone(),
            limits: config.batch_limits()?,
            policy: config.retry_policy(),
            synchronous: config.synchronous_dispatch(),
            budget,
            slots: Arc::new(Semaphore::new(budget)),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            failed_actions: AtomicU64::new(0),
            max_failed_actions: config.max_failed_actions,
            aborted: AtomicBool::new(false),
            sequence: BatchSequence::default(),
        })
    }

    /// Index every unit writes into.
    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.doc_type.as_deref()
    }

    pub fn batch_limits(&self) -> BatchLimits {
        self.limits
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn sequence(&self) -> BatchSequence {
        self.sequence.clone()
    }

    /// Maximum number of bulk requests in flight across the run.
    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest in-flight count observed so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Wait for a free dispatch slot.
    ///
    /// # Returns
    ///
    /// * `Err(LoaderError::Aborted)` - If the run is aborted while waiting
    pub async fn acquire_slot(self: &Arc<Self>) -> Result<DispatchSlot, LoaderError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| LoaderError::Aborted)?;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        Ok(DispatchSlot {
            _permit: permit,
            run: Arc::clone(self),
        })
    }

    /// Add item failures to the run total.
    ///
    /// # Returns
    ///
    /// * `Err(LoaderError::FailureThresholdExceeded)` - If the total now
    ///   exceeds `max_failed_actions`; the run is aborted as well
    pub fn record_failures(&self, count: u64) -> Result<(), LoaderError> {
        let total = self.failed_actions.fetch_add(count, Ordering::SeqCst) + count;
        match self.max_failed_actions {
            Some(max) if total > max => {
                warn!(failed = total, max = max, "Failed action limit exceeded");
                self.abort();
                Err(LoaderError::FailureThresholdExceeded { failed: total, max })
            }
            _ => Ok(()),
        }
    }

    pub fn failed_actions(&self) -> u64 {
        self.failed_actions.load(Ordering::SeqCst)
    }

    /// Stop handing out dispatch slots. Requests already in flight finish.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            self.slots.close();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self) -> Result<(), LoaderError> {
        if self.is_aborted() {
            return Err(LoaderError::Aborted);
        }
        Ok(())
    }
}

/// One unit of the concurrency budget, released on drop.
#[derive(Debug)]
pub struct DispatchSlot {
    _permit: OwnedSemaphorePermit,
    run: Arc<RunState>,
}

impl Drop for DispatchSlot {
    fn drop(&mut self) {
        self.run.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, NodeConfig};

    fn config() -> LoaderConfig {
        let mut config = LoaderConfig::new("embulk", vec![NodeConfig::new("localhost", 9200)]);
        config.concurrent_requests = 2;
        config
    }

    fn run(config: &LoaderConfig) -> Arc<RunState> {
        Arc::new(RunState::new(config, "embulk_v2").unwrap())
    }

    #[test]
    fn test_state_from_config() {
        let mut config = config();
        config.mode = Mode::Replace;
        config.alias = Some("embulk_alias".to_string());
        config.index_type = Some("embulk".to_string());

        let state = RunState::new(&config, "embulk_v2").unwrap();
        assert_eq!(state.generation(), "embulk_v2");
        assert_eq!(state.alias(), Some("embulk_alias"));
        assert_eq!(state.doc_type(), Some("embulk"));
        assert_eq!(state.budget(), 2);
        assert!(!state.synchronous());
    }

    #[test]
    fn test_unbounded_batches_rejected() {
        let mut config = config();
        config.bulk_actions = 0;
        config.bulk_size = 0;
        assert_eq!(
            RunState::new(&config, "embulk").unwrap_err(),
            ConfigError::UnboundedBatch
        );
    }

    #[tokio::test]
    async fn test_slots_track_in_flight() {
        let state = run(&config());

        let first = state.acquire_slot().await.unwrap();
        let second = state.acquire_slot().await.unwrap();
        assert_eq!(state.in_flight(), 2);
        assert!(state.slots.try_acquire().is_err());

        drop(first);
        assert_eq!(state.in_flight(), 1);
        drop(second);
        assert_eq!(state.in_flight(), 0);
        assert_eq!(state.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_abort_wakes_waiters() {
        let state = run(&config());
        let _a = state.acquire_slot().await.unwrap();
        let _b = state.acquire_slot().await.unwrap();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.acquire_slot().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        state.abort();

        assert!(matches!(waiter.await.unwrap(), Err(LoaderError::Aborted)));
        assert!(matches!(state.ensure_active(), Err(LoaderError::Aborted)));
    }

    #[test]
    fn test_failure_threshold() {
        let mut config = config();
        config.max_failed_actions = Some(3);
        let state = RunState::new(&config, "embulk").unwrap();

        state.record_failures(2).unwrap();
        state.record_failures(1).unwrap();
        assert!(!state.is_aborted());

        let err = state.record_failures(1).unwrap_err();
        assert!(matches!(
            err,
            LoaderError::FailureThresholdExceeded { failed: 4, max: 3 }
        ));
        assert!(state.is_aborted());
    }

    #[test]
    fn test_no_threshold_by_default() {
        let state = RunState::new(&config(), "embulk").unwrap();
        state.record_failures(1_000_000).unwrap();
        assert_eq!(state.failed_actions(), 1_000_000);
    }
}
