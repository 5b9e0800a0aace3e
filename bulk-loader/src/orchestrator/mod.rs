//! Orchestrator module for the bulk loader.
//!
//! Coordinates one transaction: index preparation, the parallel unit
//! writers, and the final swap or abort.

pub mod lifecycle;
pub mod run_state;
pub mod unit_writer;

use std::sync::Arc;

use bulk_loader_repository::{SearchEngineError, SearchTransport};
use bulk_loader_shared::{RecordBatch, Schema};
use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use crate::config::{LoaderConfig, Mode};
use crate::errors::LoaderError;
use crate::processor::{DocumentTransformer, IdentityResolver};

pub use lifecycle::{IndexLifecycle, LifecycleState};
pub use run_state::{DispatchSlot, RunState};
pub use unit_writer::{CommitState, RunReport, UnitReport, UnitWriter};

/// One load transaction.
///
/// The loader:
/// - Validates the configuration against the schema before any write
/// - Prepares the index generation the units write into
/// - Hands out one [`UnitWriter`] per processing unit
/// - Publishes the generation on commit, or removes it on abort
pub struct BulkLoader {
    config: Arc<LoaderConfig>,
    transport: Arc<dyn SearchTransport>,
    transformer: Arc<DocumentTransformer>,
    resolver: Arc<IdentityResolver>,
    run: Arc<RunState>,
    lifecycle: IndexLifecycle,
}

impl BulkLoader {
    /// Start a transaction.
    ///
    /// # Arguments
    ///
    /// * `config` - Loader options
    /// * `schema` - Columns of every record the units will add
    /// * `transport` - Engine connection shared by all units
    ///
    /// # Returns
    ///
    /// * `Ok(BulkLoader)` - The generation exists and units may be opened
    /// * `Err(LoaderError::Config)` - Before anything is written
    /// * `Err(LoaderError)` - If preparing the index failed
    #[instrument(skip_all, fields(index = %config.index, mode = ?config.mode))]
    pub async fn transaction(
        config: LoaderConfig,
        schema: Schema,
        transport: Arc<dyn SearchTransport>,
    ) -> Result<Self, LoaderError> {
        Self::start(config, schema, transport, None).await
    }

    /// Continue a transaction from a saved [`CommitState`].
    ///
    /// The generation is reused and a swap already applied is not repeated.
    #[instrument(skip_all, fields(index = %state.index, generation = %state.generation))]
    pub async fn resume(
        state: CommitState,
        config: LoaderConfig,
        schema: Schema,
        transport: Arc<dyn SearchTransport>,
    ) -> Result<Self, LoaderError> {
        if state.index != config.index || state.mode != config.mode {
            return Err(LoaderError::lifecycle(format!(
                "commit state for {} ({:?}) does not match configured {} ({:?})",
                state.index, state.mode, config.index, config.mode
            )));
        }
        if matches!(
            state.state,
            LifecycleState::Completed | LifecycleState::Aborted
        ) {
            return Err(LoaderError::lifecycle(format!(
                "run for {} already ended as {:?}",
                state.generation, state.state
            )));
        }
        Self::start(config, schema, transport, Some(state)).await
    }

    async fn start(
        config: LoaderConfig,
        schema: Schema,
        transport: Arc<dyn SearchTransport>,
        resume: Option<CommitState>,
    ) -> Result<Self, LoaderError> {
        config.validate()?;
        let transformer =
            DocumentTransformer::new(&schema, &config.nested_fields, &config.timestamp_format)?;
        let resolver = IdentityResolver::new(
            &schema,
            config.doc_id_column.as_deref(),
            &config.index_fields,
            config.routing_column.as_deref(),
            &config.timestamp_format,
        )?;

        let mut lifecycle = IndexLifecycle::new(&config, Arc::clone(&transport));
        let resume_generation = match resume {
            Some(state) => {
                lifecycle = lifecycle.with_retired(state.retired);
                Some(state.generation)
            }
            None => None,
        };
        lifecycle.check_cluster().await;

        let generation = match lifecycle.prepare(resume_generation.as_deref()).await {
            Ok(generation) => generation,
            Err(e) => {
                error!(error = %e, "Failed to prepare index");
                if let Err(abort_error) = lifecycle.abort().await {
                    warn!(error = %abort_error, "Abort after failed preparation failed");
                }
                return Err(e);
            }
        };
        let run = Arc::new(RunState::new(&config, generation)?);

        info!(
            generation = %run.generation(),
            alias = ?run.alias(),
            budget = run.budget(),
            "Transaction started"
        );

        Ok(Self {
            config: Arc::new(config),
            transport,
            transformer: Arc::new(transformer),
            resolver: Arc::new(resolver),
            run,
            lifecycle,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Serializable snapshot for [`BulkLoader::resume`] and [`BulkLoader::cleanup`].
    pub fn commit_state(&self) -> CommitState {
        CommitState {
            index: self.config.index.clone(),
            alias: self.run.alias().map(str::to_string),
            generation: self.run.generation().to_string(),
            mode: self.config.mode,
            state: self.lifecycle.state(),
            retired: self.lifecycle.retired().to_vec(),
        }
    }

    /// Writer for one processing unit.
    pub fn open(&self, unit: usize) -> UnitWriter {
        UnitWriter::new(
            unit,
            Arc::clone(&self.transformer),
            Arc::clone(&self.resolver),
            Arc::clone(&self.transport),
            Arc::clone(&self.run),
        )
    }

    /// Publish the run after every unit committed.
    ///
    /// In REPLACE mode this swaps the alias and deletes retired generations.
    /// A failed swap aborts the transaction before the error is returned.
    #[instrument(skip_all, fields(units = reports.len()))]
    pub async fn commit(&mut self, reports: Vec<UnitReport>) -> Result<RunReport, LoaderError> {
        if self.run.is_aborted() {
            self.abort().await?;
            return Err(LoaderError::Aborted);
        }

        let mut report = RunReport::aggregate(self.run.generation(), self.run.alias(), reports);
        report.peak_in_flight = self.run.peak_in_flight();

        match self.lifecycle.mode() {
            Mode::Insert => self.lifecycle.complete()?,
            Mode::Replace => {
                if let Err(e) = self.lifecycle.swap().await {
                    error!(error = %e, "Alias swap failed");
                    self.abort().await?;
                    return Err(e);
                }
                report.deleted = self.lifecycle.clean().await?;
            }
        }

        info!(
            generation = %report.generation,
            records = report.records,
            actions = report.actions,
            failed_actions = report.failed_actions,
            retries = report.retries,
            "Transaction committed"
        );
        Ok(report)
    }

    /// Abort the transaction.
    ///
    /// Units still writing see the abort on their next batch. The new
    /// generation is removed in REPLACE mode; the alias is never touched.
    pub async fn abort(&mut self) -> Result<(), LoaderError> {
        self.run.abort();
        self.lifecycle.abort().await
    }

    /// Run every unit's batches concurrently and commit.
    ///
    /// The first failing unit aborts the transaction and its error is
    /// returned.
    pub async fn load_units(
        &mut self,
        units: Vec<Vec<RecordBatch>>,
    ) -> Result<RunReport, LoaderError> {
        let writers = units.into_iter().enumerate().map(|(unit, batches)| {
            let mut writer = self.open(unit);
            async move {
                for batch in &batches {
                    writer.add(batch).await?;
                }
                writer.finish().await?;
                writer.commit()
            }
        });
        let results = join_all(writers).await;

        let mut reports = Vec::with_capacity(results.len());
        let mut failure: Option<LoaderError> = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                // Units stopped by another unit's failure report `Aborted`.
                Err(LoaderError::Aborted) if failure.is_some() => {}
                Err(e) => {
                    if failure.as_ref().map_or(true, |f| matches!(f, LoaderError::Aborted)) {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            if let Err(abort_error) = self.abort().await {
                warn!(error = %abort_error, "Abort after unit failure failed");
            }
            return Err(e);
        }
        self.commit(reports).await
    }

    /// Delete generations left behind by runs that never published.
    ///
    /// States whose generation is referenced by its alias are skipped.
    ///
    /// # Returns
    ///
    /// Names of the deleted indices.
    pub async fn cleanup(
        transport: &dyn SearchTransport,
        states: &[CommitState],
    ) -> Result<Vec<String>, LoaderError> {
        let mut deleted = Vec::new();
        for state in states {
            if state.mode != Mode::Replace || state.state.is_published() {
                continue;
            }
            if let Some(alias) = &state.alias {
                let targets = transport.alias_targets(alias).await?;
                if targets.contains(&state.generation) {
                    continue;
                }
            }
            match transport.delete_index(&state.generation).await {
                Ok(()) => {
                    info!(index = %state.generation, "Deleted abandoned generation");
                    deleted.push(state.generation.clone());
                }
                Err(SearchEngineError::NotFound(_)) => {}
                Err(e) => {
                    warn!(index = %state.generation, error = %e, "Failed to delete abandoned generation");
                }
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulk_loader_repository::testing::MemoryTransport;
    use bulk_loader_shared::{Column, ColumnType, Record};

    use crate::config::{GenerationSuffix, NodeConfig};

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", ColumnType::Long),
            Column::new("comment", ColumnType::String),
        ])
    }

    fn replace_config() -> LoaderConfig {
        let mut config = LoaderConfig::new("embulk", vec![NodeConfig::new("localhost", 9200)]);
        config.mode = Mode::Replace;
        config.alias = Some("embulk_alias".to_string());
        config.generation_suffix = GenerationSuffix::Counter;
        config.doc_id_column = Some("id".to_string());
        config.bulk_actions = 2;
        config
    }

    fn batch(ids: std::ops::Range<i64>) -> RecordBatch {
        RecordBatch::new(
            ids.map(|id| Record::new(vec![id.into(), "embulk".into()]))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_config_errors_before_any_write() {
        let transport = Arc::new(MemoryTransport::new());
        let mut config = replace_config();
        config.doc_id_column = Some("missing".to_string());

        let result = BulkLoader::transaction(config, schema(), transport.clone()).await;
        assert!(matches!(result, Err(LoaderError::Config(_))));
        assert!(transport.index_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_units_publishes() {
        let transport = Arc::new(MemoryTransport::new().with_alias("embulk_alias", "embulk_v1"));
        let mut loader = BulkLoader::transaction(replace_config(), schema(), transport.clone())
            .await
            .unwrap();

        let report = loader
            .load_units(vec![vec![batch(0..3)], vec![batch(3..5), batch(5..6)]])
            .await
            .unwrap();

        assert_eq!(report.units, 2);
        assert_eq!(report.records, 6);
        assert_eq!(report.deleted, vec!["embulk_v1"]);
        assert_eq!(loader.state(), LifecycleState::Completed);
        assert_eq!(transport.documents("embulk_v2").await.len(), 6);
        assert_eq!(
            transport.alias_targets("embulk_alias").await.unwrap(),
            vec!["embulk_v2"]
        );
    }

    #[tokio::test]
    async fn test_failed_swap_aborts() {
        let transport = Arc::new(MemoryTransport::new().with_alias("embulk_alias", "embulk_v1"));
        transport.fail_alias_updates().await;
        let mut loader = BulkLoader::transaction(replace_config(), schema(), transport.clone())
            .await
            .unwrap();

        let result = loader.load_units(vec![vec![batch(0..2)]]).await;

        assert!(matches!(result, Err(LoaderError::Transport(_))));
        assert_eq!(loader.state(), LifecycleState::Aborted);
        assert_eq!(transport.index_names().await, vec!["embulk_v1"]);
    }

    #[tokio::test]
    async fn test_commit_after_abort_fails() {
        let transport = Arc::new(MemoryTransport::new());
        let mut loader = BulkLoader::transaction(replace_config(), schema(), transport.clone())
            .await
            .unwrap();

        let mut writer = loader.open(0);
        writer.add(&batch(0..1)).await.unwrap();
        writer.abort().await;

        assert!(matches!(
            loader.commit(Vec::new()).await,
            Err(LoaderError::Aborted)
        ));
        assert!(transport.index_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_resume_and_cleanup() {
        let transport = Arc::new(MemoryTransport::new().with_alias("embulk_alias", "embulk_v1"));
        let loader = BulkLoader::transaction(replace_config(), schema(), transport.clone())
            .await
            .unwrap();
        let state = loader.commit_state();
        assert_eq!(state.generation, "embulk_v2");
        assert_eq!(state.state, LifecycleState::Loading);
        drop(loader);

        let mut resumed =
            BulkLoader::resume(state.clone(), replace_config(), schema(), transport.clone())
                .await
                .unwrap();
        assert_eq!(resumed.run_state().generation(), "embulk_v2");
        resumed.load_units(vec![vec![batch(0..1)]]).await.unwrap();

        let deleted = BulkLoader::cleanup(transport.as_ref(), &[state]).await.unwrap();
        assert!(deleted.is_empty());
        assert_eq!(transport.index_names().await, vec!["embulk_v2"]);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_unpublished_generation() {
        let transport = Arc::new(MemoryTransport::new().with_alias("embulk_alias", "embulk_v1"));
        let loader = BulkLoader::transaction(replace_config(), schema(), transport.clone())
            .await
            .unwrap();
        let state = loader.commit_state();
        drop(loader);

        let deleted = BulkLoader::cleanup(transport.as_ref(), &[state]).await.unwrap();
        assert_eq!(deleted, vec!["embulk_v2"]);
        assert_eq!(transport.index_names().await, vec!["embulk_v1"]);
    }

    #[tokio::test]
    async fn test_resume_published_run_then_abort_keeps_live_generation() {
        let transport = Arc::new(MemoryTransport::new().with_alias("embulk_alias", "embulk_v2"));
        let state = CommitState {
            index: "embulk".to_string(),
            alias: Some("embulk_alias".to_string()),
            generation: "embulk_v2".to_string(),
            mode: Mode::Replace,
            state: LifecycleState::Published,
            retired: Vec::new(),
        };

        let mut loader = BulkLoader::resume(state, replace_config(), schema(), transport.clone())
            .await
            .unwrap();
        loader.abort().await.unwrap();

        assert_eq!(loader.state(), LifecycleState::Aborted);
        assert_eq!(transport.index_names().await, vec!["embulk_v2"]);
        assert_eq!(
            transport.alias_targets("embulk_alias").await.unwrap(),
            vec!["embulk_v2"]
        );
    }

    #[tokio::test]
    async fn test_timestamp_run_started_after_publish_then_abort_keeps_live() {
        let live = format!("embulk_{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        let transport = Arc::new(MemoryTransport::new().with_alias("embulk_alias", &live));
        let mut config = replace_config();
        config.generation_suffix = GenerationSuffix::Timestamp;

        let mut loader = BulkLoader::transaction(config, schema(), transport.clone())
            .await
            .unwrap();
        assert_ne!(loader.run_state().generation(), live);
        loader.abort().await.unwrap();

        assert_eq!(transport.index_names().await, vec![live.clone()]);
        assert_eq!(
            transport.alias_targets("embulk_alias").await.unwrap(),
            vec![live]
        );
    }

    #[tokio::test]
    async fn test_resume_after_swap_deletes_previous_generation() {
        let transport = Arc::new(MemoryTransport::new().with_alias("embulk_alias", "embulk_v1"));
        let mut loader = BulkLoader::transaction(replace_config(), schema(), transport.clone())
            .await
            .unwrap();
        let state = loader.commit_state();
        assert_eq!(state.retired, vec!["embulk_v1"]);

        // The process stops right after the alias moved.
        loader.lifecycle.swap().await.unwrap();
        drop(loader);
        assert_eq!(
            transport.alias_targets("embulk_alias").await.unwrap(),
            vec!["embulk_v2"]
        );

        let mut resumed = BulkLoader::resume(state, replace_config(), schema(), transport.clone())
            .await
            .unwrap();
        let report = resumed.load_units(vec![vec![batch(0..2)]]).await.unwrap();

        assert_eq!(report.deleted, vec!["embulk_v1"]);
        assert_eq!(transport.index_names().await, vec!["embulk_v2"]);
        assert_eq!(resumed.state(), LifecycleState::Completed);
    }

    #[tokio::test]
    async fn test_resume_rejects_finished_state() {
        let transport = Arc::new(MemoryTransport::new());
        let state = CommitState {
            index: "embulk".to_string(),
            alias: Some("embulk_alias".to_string()),
            generation: "embulk_v1".to_string(),
            mode: Mode::Replace,
            state: LifecycleState::Completed,
            retired: Vec::new(),
        };

        let result = BulkLoader::resume(state, replace_config(), schema(), transport).await;
        assert!(matches!(result, Err(LoaderError::Lifecycle(_))));
    }
}
