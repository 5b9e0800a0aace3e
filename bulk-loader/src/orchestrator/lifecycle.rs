//! Index generation lifecycle.
//!
//! In REPLACE mode a run loads into a fresh index generation and publishes it
//! by moving the alias in one `_aliases` request, so readers see either the
//! old or the new generation and never neither. Retired generations are
//! deleted afterwards. In INSERT mode the run writes straight into the named
//! index and only the `Preparing` and `Loading` states are used.
//!
//! ```text
//! Idle -> Preparing -> Loading -> Swapping -> Published -> Cleaning -> Completed
//!                          \-> Completed (INSERT)
//! Idle | Preparing | Loading | Swapping -> Aborted
//! ```

use std::sync::Arc;

use bulk_loader_repository::{AliasAction, SearchEngineError, SearchTransport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{GenerationSuffix, LoaderConfig, Mode};
use crate::errors::LoaderError;

/// Lifecycle position of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Idle,
    Preparing,
    Loading,
    Swapping,
    Published,
    Cleaning,
    Completed,
    Aborted,
}

impl LifecycleState {
    fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Idle, Preparing)
                | (Preparing, Loading)
                | (Loading, Swapping)
                | (Loading, Completed)
                | (Swapping, Published)
                | (Published, Cleaning)
                | (Cleaning, Completed)
                | (Idle | Preparing | Loading | Swapping, Aborted)
        )
    }

    /// Whether the alias may already point at the new generation.
    pub fn is_published(self) -> bool {
        matches!(
            self,
            LifecycleState::Published | LifecycleState::Cleaning | LifecycleState::Completed
        )
    }
}

/// Drives index creation, alias swap and cleanup for one run.
pub struct IndexLifecycle {
    transport: Arc<dyn SearchTransport>,
    mode: Mode,
    base_index: String,
    alias: Option<String>,
    suffix: GenerationSuffix,
    index_settings: Option<Value>,
    cluster: String,
    state: LifecycleState,
    generation: Option<String>,
    retired: Vec<String>,
}

impl IndexLifecycle {
    pub fn new(config: &LoaderConfig, transport: Arc<dyn SearchTransport>) -> Self {
        Self {
            transport,
            mode: config.mode,
            base_index: config.index.clone(),
            alias: config.alias_name().map(str::to_string),
            suffix: config.generation_suffix,
            index_settings: config.index_settings.clone(),
            cluster: config.cluster.clone(),
            state: LifecycleState::Idle,
            generation: None,
            retired: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The index this run writes into, once prepared.
    pub fn generation(&self) -> Option<&str> {
        self.generation.as_deref()
    }

    /// Generations the alias pointed at before the swap.
    pub fn retired(&self) -> &[String] {
        &self.retired
    }

    /// Carry over generations an interrupted run had already retired.
    pub fn with_retired(mut self, retired: Vec<String>) -> Self {
        self.retired = retired;
        self
    }

    fn transition(&mut self, to: LifecycleState) -> Result<(), LoaderError> {
        if !self.state.can_transition_to(to) {
            return Err(LoaderError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(from = ?self.state, to = ?to, "Lifecycle transition");
        self.state = to;
        Ok(())
    }

    /// Compare the engine's cluster name with the configured one.
    ///
    /// A mismatch or a failed lookup is only logged.
    pub async fn check_cluster(&self) {
        match self.transport.cluster_name().await {
            Ok(name) if name == self.cluster => {
                debug!(cluster = %name, "Connected to expected cluster");
            }
            Ok(name) => {
                warn!(expected = %self.cluster, actual = %name, "Cluster name mismatch");
            }
            Err(e) => {
                warn!(error = %e, "Could not read cluster name");
            }
        }
    }

    /// Create (or reuse) the index the run writes into and move to `Loading`.
    ///
    /// A fresh REPLACE run always gets an index no other run has created.
    ///
    /// # Arguments
    ///
    /// * `resume_generation` - Generation of an interrupted run to reuse
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - Name of the index to write into
    /// * `Err(LoaderError)` - If the index cannot be created; the lifecycle
    ///   stays in `Preparing` so the caller can abort
    #[instrument(skip(self), fields(index = %self.base_index, mode = ?self.mode))]
    pub async fn prepare(
        &mut self,
        resume_generation: Option<&str>,
    ) -> Result<String, LoaderError> {
        self.transition(LifecycleState::Preparing)?;

        let generation = match self.mode {
            Mode::Insert => {
                self.generation = Some(self.base_index.clone());
                if !self.transport.index_exists(&self.base_index).await? {
                    self.create(&self.base_index.clone(), true).await?;
                }
                self.base_index.clone()
            }
            Mode::Replace => {
                let alias = self.alias_name()?.to_string();
                if self.transport.index_exists(&alias).await?
                    && !self.transport.alias_exists(&alias).await?
                {
                    return Err(LoaderError::lifecycle(format!(
                        "'{}' is an existing index, not an alias",
                        alias
                    )));
                }

                let generation = match resume_generation {
                    Some(generation) => {
                        self.create(generation, true).await?;
                        generation.to_string()
                    }
                    None => {
                        let targets = self.transport.alias_targets(&alias).await?;
                        let generation = self.next_generation(&targets).await?;
                        self.create(&generation, false).await?;
                        self.retired = targets;
                        generation
                    }
                };
                self.generation = Some(generation.clone());
                generation
            }
        };

        info!(generation = %generation, "Index generation ready");
        self.transition(LifecycleState::Loading)?;
        Ok(generation)
    }

    async fn create(&self, name: &str, resumed: bool) -> Result<(), LoaderError> {
        match self
            .transport
            .create_index(name, self.index_settings.as_ref())
            .await
        {
            Ok(()) => {
                info!(index = %name, "Created index");
                Ok(())
            }
            Err(SearchEngineError::IndexAlreadyExists(_)) if resumed => {
                debug!(index = %name, "Index already exists");
                Ok(())
            }
            Err(SearchEngineError::IndexAlreadyExists(_)) => Err(LoaderError::lifecycle(format!(
                "generation '{}' was created by another run",
                name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn next_generation(&self, targets: &[String]) -> Result<String, LoaderError> {
        match self.suffix {
            GenerationSuffix::Timestamp => {
                let name = format!(
                    "{}_{}",
                    self.base_index,
                    Utc::now().format("%Y%m%d-%H%M%S")
                );
                self.unused_name(name).await
            }
            GenerationSuffix::Counter => {
                let prefix = format!("{}_v", self.base_index);
                let current = targets
                    .iter()
                    .filter_map(|target| target.strip_prefix(&prefix)?.parse::<u64>().ok())
                    .max()
                    .unwrap_or(0);

                let mut counter = current + 1;
                while self
                    .transport
                    .index_exists(&format!("{}{}", prefix, counter))
                    .await?
                {
                    counter += 1;
                }
                Ok(format!("{}{}", prefix, counter))
            }
        }
    }

    /// `name`, or `name-N` with the lowest N that is not an index yet.
    async fn unused_name(&self, name: String) -> Result<String, LoaderError> {
        if !self.transport.index_exists(&name).await? {
            return Ok(name);
        }
        let mut n = 1u64;
        loop {
            let candidate = format!("{}-{}", name, n);
            if !self.transport.index_exists(&candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    fn alias_name(&self) -> Result<&str, LoaderError> {
        self.alias
            .as_deref()
            .ok_or_else(|| LoaderError::lifecycle("no alias configured"))
    }

    fn generation_name(&self) -> Result<String, LoaderError> {
        self.generation
            .clone()
            .ok_or_else(|| LoaderError::lifecycle("no index generation prepared"))
    }

    /// Point the alias at the new generation in one request.
    ///
    /// Does nothing beyond the state change when the alias already points
    /// only at the new generation, e.g. on a resumed run.
    #[instrument(skip(self), fields(alias = ?self.alias, generation = ?self.generation))]
    pub async fn swap(&mut self) -> Result<(), LoaderError> {
        self.transition(LifecycleState::Swapping)?;
        let alias = self.alias_name()?.to_string();
        let generation = self.generation_name()?;

        let targets = self.transport.alias_targets(&alias).await?;
        let stale: Vec<String> = targets
            .iter()
            .filter(|target| **target != generation)
            .cloned()
            .collect();

        if stale.is_empty() && targets.contains(&generation) {
            info!("Alias already points at generation");
        } else {
            let mut actions: Vec<AliasAction> = stale
                .iter()
                .map(|old| AliasAction::remove(old.clone(), alias.clone()))
                .collect();
            if !targets.contains(&generation) {
                actions.push(AliasAction::add(generation.clone(), alias.clone()));
            }
            self.transport.update_aliases(&actions).await?;
            info!(retired = ?stale, "Alias swapped");
        }

        // Generations retired before an interruption are no longer alias targets.
        let mut retired = std::mem::take(&mut self.retired);
        retired.retain(|index| *index != generation);
        for index in stale {
            if !retired.contains(&index) {
                retired.push(index);
            }
        }
        self.retired = retired;
        self.transition(LifecycleState::Published)
    }

    /// Delete retired generations. Failures are logged and skipped.
    ///
    /// # Returns
    ///
    /// Names of the indices actually deleted.
    pub async fn clean(&mut self) -> Result<Vec<String>, LoaderError> {
        self.transition(LifecycleState::Cleaning)?;

        let mut deleted = Vec::with_capacity(self.retired.len());
        for index in &self.retired {
            match self.transport.delete_index(index).await {
                Ok(()) => {
                    info!(index = %index, "Deleted retired generation");
                    deleted.push(index.clone());
                }
                Err(SearchEngineError::NotFound(_)) => {
                    debug!(index = %index, "Retired generation already gone");
                }
                Err(e) => {
                    warn!(index = %index, error = %e, "Failed to delete retired generation");
                }
            }
        }

        self.transition(LifecycleState::Completed)?;
        Ok(deleted)
    }

    /// End an INSERT run, which has nothing to publish.
    pub fn complete(&mut self) -> Result<(), LoaderError> {
        if self.mode == Mode::Replace {
            return Err(LoaderError::InvalidTransition {
                from: self.state,
                to: LifecycleState::Completed,
            });
        }
        self.transition(LifecycleState::Completed)
    }

    /// Abandon the run.
    ///
    /// In REPLACE mode the new generation is deleted unless the alias
    /// points at it, which happens after a swap or when a published run is
    /// resumed. The previous generation and the alias are left alone.
    /// Deletion failures are logged.
    #[instrument(skip(self), fields(state = ?self.state, generation = ?self.generation))]
    pub async fn abort(&mut self) -> Result<(), LoaderError> {
        if self.state == LifecycleState::Aborted {
            return Ok(());
        }
        self.transition(LifecycleState::Aborted)?;

        let (Mode::Replace, Some(generation)) = (self.mode, self.generation.as_deref()) else {
            info!("Run aborted");
            return Ok(());
        };

        if let Some(alias) = self.alias.as_deref() {
            match self.transport.alias_targets(alias).await {
                Ok(targets) if targets.iter().any(|target| target == generation) => {
                    error!(
                        alias = %alias,
                        "Alias points at the aborted generation, leaving it in place"
                    );
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Could not read alias, leaving generation in place");
                    return Ok(());
                }
            }
        }

        match self.transport.delete_index(generation).await {
            Ok(()) | Err(SearchEngineError::NotFound(_)) => {
                info!("Deleted aborted generation");
            }
            Err(e) => {
                warn!(error = %e, "Failed to delete aborted generation");
            }
        }
        Ok(())
    }
}
