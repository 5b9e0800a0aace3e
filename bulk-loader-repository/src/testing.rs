//! In-memory `SearchTransport` for tests of code built on this crate.
//!
//! Enabled with the `test-util` feature.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bulk_loader_shared::BulkAction;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::errors::SearchEngineError;
use crate::interfaces::SearchTransport;
use crate::types::{AliasAction, BulkItemOutcome, BulkResponse, ItemFailure};

pub type AliasMap = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Default)]
pub struct MemoryIndex {
    pub settings: Option<Value>,
    pub documents: BTreeMap<String, Map<String, Value>>,
    pub routing: BTreeMap<String, String>,
    pub doc_types: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    indices: BTreeMap<String, MemoryIndex>,
    aliases: AliasMap,
    alias_history: Vec<AliasMap>,
    bulk_failures: VecDeque<SearchEngineError>,
    rejected_ids: HashSet<String>,
    failing_deletes: HashSet<String>,
    fail_alias_updates: bool,
    next_auto_id: u64,
}

/// Simulates indices, aliases and bulk writes of an engine.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    cluster: String,
    bulk_delay: Duration,
    bulk_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            cluster: "opensearch".to_string(),
            bulk_delay: Duration::ZERO,
            bulk_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = cluster.to_string();
        self
    }

    pub fn with_index(mut self, name: &str) -> Self {
        self.state
            .get_mut()
            .indices
            .insert(name.to_string(), MemoryIndex::default());
        self
    }

    pub fn with_alias(mut self, alias: &str, index: &str) -> Self {
        let state = self.state.get_mut();
        state.indices.entry(index.to_string()).or_default();
        state
            .aliases
            .entry(alias.to_string())
            .or_default()
            .insert(index.to_string());
        self
    }

    /// Every bulk call sleeps this long before answering.
    pub fn with_bulk_delay(mut self, delay: Duration) -> Self {
        self.bulk_delay = delay;
        self
    }

    /// The next `count` bulk calls fail with `error`.
    pub async fn fail_next_bulks(&self, count: usize, error: SearchEngineError) {
        let mut state = self.state.lock().await;
        state
            .bulk_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Actions with this id are rejected per item.
    pub async fn reject_id(&self, id: &str) {
        self.state.lock().await.rejected_ids.insert(id.to_string());
    }

    pub async fn fail_delete(&self, index: &str) {
        self.state
            .lock()
            .await
            .failing_deletes
            .insert(index.to_string());
    }

    pub async fn fail_alias_updates(&self) {
        self.state.lock().await.fail_alias_updates = true;
    }

    pub async fn index_names(&self) -> Vec<String> {
        self.state.lock().await.indices.keys().cloned().collect()
    }

    pub async fn documents(&self, index: &str) -> Vec<(String, Map<String, Value>)> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .map(|index| {
                index
                    .documents
                    .iter()
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn routing(&self, index: &str, id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .and_then(|index| index.routing.get(id).cloned())
    }

    pub async fn doc_type(&self, index: &str, id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .and_then(|index| index.doc_types.get(id).cloned())
    }

    pub async fn settings(&self, index: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .and_then(|index| index.settings.clone())
    }

    /// Alias table after every applied alias update.
    pub async fn alias_history(&self) -> Vec<AliasMap> {
        self.state.lock().await.alias_history.clone()
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchTransport for MemoryTransport {
    async fn cluster_name(&self) -> Result<String, SearchEngineError> {
        Ok(self.cluster.clone())
    }

    async fn create_index(
        &self,
        name: &str,
        settings: Option<&Value>,
    ) -> Result<(), SearchEngineError> {
        let mut state = self.state.lock().await;
        if state.indices.contains_key(name) || state.aliases.contains_key(name) {
            return Err(SearchEngineError::IndexAlreadyExists(name.to_string()));
        }
        state.indices.insert(
            name.to_string(),
            MemoryIndex {
                settings: settings.cloned(),
                ..MemoryIndex::default()
            },
        );
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> Result<bool, SearchEngineError> {
        let state = self.state.lock().await;
        Ok(state.indices.contains_key(name) || state.aliases.contains_key(name))
    }

    async fn alias_exists(&self, name: &str) -> Result<bool, SearchEngineError> {
        Ok(self.state.lock().await.aliases.contains_key(name))
    }

    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>, SearchEngineError> {
        Ok(self
            .state
            .lock()
            .await
            .aliases
            .get(alias)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn bulk(
        &self,
        index: &str,
        doc_type: Option<&str>,
        actions: &[BulkAction],
    ) -> Result<BulkResponse, SearchEngineError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.bulk_delay.is_zero() {
            tokio::time::sleep(self.bulk_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        if let Some(error) = state.bulk_failures.pop_front() {
            return Err(error);
        }

        let mut items = Vec::with_capacity(actions.len());
        for action in actions {
            let id = match action.id() {
                Some(id) => id.to_string(),
                None => {
                    state.next_auto_id += 1;
                    format!("auto-{}", state.next_auto_id)
                }
            };

            let failure = state
                .rejected_ids
                .contains(&id)
                .then(|| ItemFailure {
                    kind: "mapper_parsing_exception".to_string(),
                    reason: format!("failed to parse document {}", id),
                });

            if failure.is_none() {
                let target = state.indices.entry(index.to_string()).or_default();
                target.documents.insert(id.clone(), action.source().clone());
                if let Some(routing) = action.routing() {
                    target.routing.insert(id.clone(), routing.to_string());
                }
                if let Some(doc_type) = doc_type {
                    target.doc_types.insert(id.clone(), doc_type.to_string());
                }
            }

            items.push(BulkItemOutcome {
                operation: "index".to_string(),
                index: Some(index.to_string()),
                doc_type: doc_type.map(str::to_string),
                id: Some(id),
                status: if failure.is_some() { 400 } else { 201 },
                failure,
            });
        }

        Ok(BulkResponse {
            took_millis: Some(1),
            items,
        })
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), SearchEngineError> {
        let mut state = self.state.lock().await;
        if state.fail_alias_updates {
            return Err(SearchEngineError::ServerError {
                status: 500,
                body: "alias update failed".to_string(),
            });
        }

        let mut aliases = state.aliases.clone();
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    if !state.indices.contains_key(index) {
                        return Err(SearchEngineError::not_found(index.clone()));
                    }
                    aliases.entry(alias.clone()).or_default().insert(index.clone());
                }
                AliasAction::Remove { index, alias } => {
                    let removed = aliases
                        .get_mut(alias)
                        .map(|targets| targets.remove(index))
                        .unwrap_or(false);
                    if !removed {
                        return Err(SearchEngineError::not_found(format!(
                            "{} is not aliased as {}",
                            index, alias
                        )));
                    }
                }
            }
        }
        aliases.retain(|_, targets| !targets.is_empty());

        state.aliases = aliases.clone();
        state.alias_history.push(aliases);
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<(), SearchEngineError> {
        let mut state = self.state.lock().await;
        if state.failing_deletes.contains(name) {
            return Err(SearchEngineError::ServerError {
                status: 503,
                body: format!("cannot delete {}", name),
            });
        }
        if state.indices.remove(name).is_none() {
            return Err(SearchEngineError::not_found(name.to_string()));
        }
        for targets in state.aliases.values_mut() {
            targets.remove(name);
        }
        state.aliases.retain(|_, targets| !targets.is_empty());
        Ok(())
    }
}
