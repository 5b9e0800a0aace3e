//! Bulk batch accumulation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bulk_loader_repository::bulk::encoded_len;
use bulk_loader_shared::BulkAction;

use crate::errors::ConfigError;

/// Batch thresholds. Zero means unbounded for that dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    max_actions: usize,
    max_bytes: usize,
}

impl BatchLimits {
    /// Create limits from an action count and a byte size.
    ///
    /// # Returns
    ///
    /// * `Err(ConfigError::UnboundedBatch)` - If both limits are zero
    pub fn new(max_actions: usize, max_bytes: usize) -> Result<Self, ConfigError> {
        if max_actions == 0 && max_bytes == 0 {
            return Err(ConfigError::UnboundedBatch);
        }
        Ok(Self {
            max_actions,
            max_bytes,
        })
    }

    pub fn max_actions(&self) -> Option<usize> {
        (self.max_actions > 0).then_some(self.max_actions)
    }

    pub fn max_bytes(&self) -> Option<usize> {
        (self.max_bytes > 0).then_some(self.max_bytes)
    }

    fn exceeds_bytes(&self, bytes: usize) -> bool {
        self.max_bytes > 0 && bytes > self.max_bytes
    }

    fn is_full(&self, actions: usize, bytes: usize) -> bool {
        (self.max_actions > 0 && actions >= self.max_actions)
            || (self.max_bytes > 0 && bytes >= self.max_bytes)
    }
}

/// Run-wide batch numbering shared by every unit.
#[derive(Debug, Clone, Default)]
pub struct BatchSequence(Arc<AtomicU64>);

impl BatchSequence {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of sequence values handed out so far.
    pub fn issued(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A sealed group of actions sent as one bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkBatch {
    sequence: u64,
    actions: Vec<BulkAction>,
    estimated_bytes: usize,
}

impl BulkBatch {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn actions(&self) -> &[BulkAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Estimated size of the request body in bytes.
    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }
}

/// Collects actions until a threshold seals them into a [`BulkBatch`].
///
/// An action that would push a non-empty batch past the byte limit seals the
/// pending actions first and starts the next batch. An action larger than
/// the byte limit on its own is sent alone.
#[derive(Debug)]
pub struct BatchAccumulator {
    limits: BatchLimits,
    index: String,
    doc_type: Option<String>,
    sequence: BatchSequence,
    pending: Vec<BulkAction>,
    pending_bytes: usize,
}

impl BatchAccumulator {
    /// Create an accumulator for actions targeting `index`.
    ///
    /// The index and document type only feed the byte estimate; they must
    /// match what the dispatcher sends.
    pub fn new(
        limits: BatchLimits,
        index: impl Into<String>,
        doc_type: Option<String>,
        sequence: BatchSequence,
    ) -> Self {
        Self {
            limits,
            index: index.into(),
            doc_type,
            sequence,
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Add one action, returning a batch if one was sealed.
    pub fn append(&mut self, action: BulkAction) -> Option<BulkBatch> {
        let size = encoded_len(&self.index, self.doc_type.as_deref(), &action);

        let mut sealed = None;
        if !self.pending.is_empty() && self.limits.exceeds_bytes(self.pending_bytes + size) {
            sealed = self.seal();
        }

        self.pending.push(action);
        self.pending_bytes += size;

        // At most one batch per call; an oversized action left pending here
        // seals on the next append or at finish.
        if sealed.is_none() && self.limits.is_full(self.pending.len(), self.pending_bytes) {
            sealed = self.seal();
        }
        sealed
    }

    /// Seal whatever is pending at end of stream.
    pub fn finish(&mut self) -> Option<BulkBatch> {
        self.seal()
    }

    pub fn pending_actions(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    fn seal(&mut self) -> Option<BulkBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let batch = BulkBatch {
            sequence: self.sequence.next(),
            actions: std::mem::take(&mut self.pending),
            estimated_bytes: std::mem::take(&mut self.pending_bytes),
        };
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn action(comment: &str) -> BulkAction {
        let mut source = Map::new();
        source.insert("comment".to_string(), Value::String(comment.to_string()));
        BulkAction::new(source, None)
    }

    fn accumulator(max_actions: usize, max_bytes: usize) -> BatchAccumulator {
        BatchAccumulator::new(
            BatchLimits::new(max_actions, max_bytes).unwrap(),
            "embulk",
            None,
            BatchSequence::default(),
        )
    }

    fn action_size(comment: &str) -> usize {
        encoded_len("embulk", None, &action(comment))
    }

    fn drive(accumulator: &mut BatchAccumulator, actions: Vec<BulkAction>) -> Vec<BulkBatch> {
        let mut batches: Vec<BulkBatch> = actions
            .into_iter()
            .filter_map(|action| accumulator.append(action))
            .collect();
        batches.extend(accumulator.finish());
        batches
    }

    #[test]
    fn test_both_limits_zero_is_rejected() {
        assert_eq!(BatchLimits::new(0, 0), Err(ConfigError::UnboundedBatch));
        assert!(BatchLimits::new(0, 10).is_ok());
        assert!(BatchLimits::new(10, 0).is_ok());
    }

    #[test]
    fn test_seals_on_action_count() {
        let mut accumulator = accumulator(2, 0);

        assert!(accumulator.append(action("a")).is_none());
        let batch = accumulator.append(action("b")).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.sequence(), 0);
        assert_eq!(batch.estimated_bytes(), action_size("a") + action_size("b"));
        assert_eq!(accumulator.pending_actions(), 0);
        assert_eq!(accumulator.pending_bytes(), 0);
    }

    #[test]
    fn test_seals_before_exceeding_bytes() {
        let size = action_size("a");
        let mut accumulator = accumulator(0, size * 2 + size / 2);

        assert!(accumulator.append(action("a")).is_none());
        assert!(accumulator.append(action("b")).is_none());
        let batch = accumulator.append(action("c")).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(accumulator.pending_actions(), 1);
    }

    #[test]
    fn test_seals_when_bytes_reached_exactly() {
        let size = action_size("a");
        let mut accumulator = accumulator(0, size * 2);

        assert!(accumulator.append(action("a")).is_none());
        let batch = accumulator.append(action("b")).unwrap();
        assert_eq!(batch.estimated_bytes(), size * 2);
    }

    #[test]
    fn test_oversized_action_is_sent_alone() {
        let small = action_size("a");
        let mut accumulator = accumulator(0, small + 1);
        let big = "x".repeat(100);

        assert!(accumulator.append(action("a")).is_none());
        let first = accumulator.append(action(&big)).unwrap();
        assert_eq!(first.actions(), &[action("a")]);

        let second = accumulator.append(action("b")).unwrap();
        assert_eq!(second.actions(), &[action(&big)]);
        assert_eq!(accumulator.finish().unwrap().actions(), &[action("b")]);
    }

    #[test]
    fn test_finish_seals_once() {
        let mut accumulator = accumulator(10, 0);
        accumulator.append(action("a"));

        assert_eq!(accumulator.finish().unwrap().len(), 1);
        assert!(accumulator.finish().is_none());
    }

    #[test]
    fn test_batches_never_exceed_limits() {
        let size = action_size("abc");
        let comments: Vec<String> = (0..200).map(|i| format!("{:03}", i)).collect();

        for (max_actions, max_bytes) in [(7, 0), (0, size * 5), (3, size * 2), (50, size * 9)] {
            let mut accumulator = accumulator(max_actions, max_bytes);
            let actions = comments.iter().map(|c| action(c)).collect();
            let batches = drive(&mut accumulator, actions);

            let total: usize = batches.iter().map(BulkBatch::len).sum();
            assert_eq!(total, 200);
            for batch in &batches {
                assert!(!batch.is_empty());
                if max_actions > 0 {
                    assert!(batch.len() <= max_actions);
                }
                if max_bytes > 0 {
                    assert!(batch.estimated_bytes() <= max_bytes);
                }
            }
            let sequences: Vec<u64> = batches.iter().map(BulkBatch::sequence).collect();
            let expected: Vec<u64> = (0..batches.len() as u64).collect();
            assert_eq!(sequences, expected);
        }
    }

    #[test]
    fn test_sequence_is_shared() {
        let sequence = BatchSequence::default();
        let limits = BatchLimits::new(1, 0).unwrap();
        let mut first = BatchAccumulator::new(limits, "embulk", None, sequence.clone());
        let mut second = BatchAccumulator::new(limits, "embulk", None, sequence.clone());

        assert_eq!(first.append(action("a")).unwrap().sequence(), 0);
        assert_eq!(second.append(action("b")).unwrap().sequence(), 1);
        assert_eq!(sequence.issued(), 2);
    }

    #[test]
    fn test_byte_estimate_counts_type_and_id() {
        let plain = encoded_len("embulk", None, &action("a"));
        let typed = encoded_len("embulk", Some("embulk"), &action("a"));
        assert!(typed > plain);
        assert_eq!(
            plain,
            json!({"index": {"_index": "embulk"}}).to_string().len()
                + json!({"comment": "a"}).to_string().len()
                + 2
        );
    }
}
