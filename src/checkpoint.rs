//! Checkpoint storage and the commit transaction.
//!
//! A checkpoint records, per (consumer, producer) edge, the last offset
//! the consumer has processed. Checkpoints only ever move forward; a
//! backward advance indicates corruption and is fatal. The
//! [`CommitTxn`] scoped transaction staples a dataset's data append to
//! its checkpoint advances: a [`PendingCommit`] intent (the output
//! range plus every staged advance) is recorded first, then data is
//! applied (idempotent by offset range), then checkpoints, then the
//! intent is cleared. A crash anywhere in between leaves an intent the
//! engine completes next cycle by replaying exactly the recorded input
//! frontier, so rows are never duplicated even when newer upstream
//! input has arrived in the meantime.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::{Offset, OffsetRange, RowBatch};
use crate::error::{CascadeError, Result};
use crate::store::TableStore;

/// A commit intent staged before its data append. Records the output
/// offset range and the per-producer checkpoint targets, which is
/// enough to replay an interrupted commit over its original input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommit {
    pub range: OffsetRange,
    /// `(producer, target offset)` per staged advance.
    pub advances: Vec<(String, u64)>,
}

/// Durable record of per-edge consumption progress and in-flight
/// commit intents.
pub trait CheckpointStore: Send + Sync {
    /// Last recorded offset, or `None` if the consumer never consumed
    /// from this producer.
    fn get(&self, consumer: &str, producer: &str) -> Result<Option<Offset>>;

    /// Advance an edge's checkpoint. Fails with `NonMonotonicOffset` if
    /// the offered offset is below the recorded one.
    fn advance(&self, consumer: &str, producer: &str, offset: Offset) -> Result<()>;

    /// Record a commit intent for a consumer, replacing any prior one.
    fn stage(&self, consumer: &str, pending: PendingCommit) -> Result<()>;

    /// The staged intent of a commit that never completed, if any.
    fn pending(&self, consumer: &str) -> Result<Option<PendingCommit>>;

    /// Remove a consumer's intent once appends and advances have applied.
    fn clear(&self, consumer: &str) -> Result<()>;
}

type EdgeOffsets = HashMap<String, HashMap<String, u64>>;

fn check_monotonic(
    edges: &EdgeOffsets,
    consumer: &str,
    producer: &str,
    offset: Offset,
) -> Result<()> {
    if let Some(recorded) = edges.get(consumer).and_then(|m| m.get(producer)) {
        if offset.value() < *recorded {
            return Err(CascadeError::NonMonotonicOffset {
                consumer: consumer.to_string(),
                producer: producer.to_string(),
                recorded: *recorded,
                offered: offset.value(),
            });
        }
    }
    Ok(())
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    edges: Mutex<EdgeOffsets>,
    pending: Mutex<HashMap<String, PendingCommit>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, consumer: &str, producer: &str) -> Result<Option<Offset>> {
        Ok(self
            .edges
            .lock()
            .get(consumer)
            .and_then(|m| m.get(producer))
            .copied()
            .map(Offset))
    }

    fn advance(&self, consumer: &str, producer: &str, offset: Offset) -> Result<()> {
        let mut edges = self.edges.lock();
        check_monotonic(&edges, consumer, producer, offset)?;
        edges
            .entry(consumer.to_string())
            .or_default()
            .insert(producer.to_string(), offset.value());
        Ok(())
    }

    fn stage(&self, consumer: &str, pending: PendingCommit) -> Result<()> {
        self.pending.lock().insert(consumer.to_string(), pending);
        Ok(())
    }

    fn pending(&self, consumer: &str) -> Result<Option<PendingCommit>> {
        Ok(self.pending.lock().get(consumer).cloned())
    }

    fn clear(&self, consumer: &str) -> Result<()> {
        self.pending.lock().remove(consumer);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
    edges: EdgeOffsets,
    #[serde(default)]
    pending: HashMap<String, PendingCommit>,
}

/// Checkpoint store persisted as a JSON file, surviving process
/// restarts. Writes go to a sibling temp file first and are renamed into
/// place so a crash mid-write never corrupts the recorded state.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileCheckpointStore {
    /// Open (or create) the store at `path`, loading any recorded state.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|err| {
                CascadeError::storage(format!(
                    "corrupt checkpoint file {}: {err}",
                    path.display()
                ))
            })?
        } else {
            FileState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &FileState) -> Result<()> {
        let raw = serde_json::to_string_pretty(state)
            .map_err(|err| CascadeError::storage(format!("serialize checkpoints: {err}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, consumer: &str, producer: &str) -> Result<Option<Offset>> {
        Ok(self
            .state
            .lock()
            .edges
            .get(consumer)
            .and_then(|m| m.get(producer))
            .copied()
            .map(Offset))
    }

    fn advance(&self, consumer: &str, producer: &str, offset: Offset) -> Result<()> {
        let mut state = self.state.lock();
        check_monotonic(&state.edges, consumer, producer, offset)?;
        state
            .edges
            .entry(consumer.to_string())
            .or_default()
            .insert(producer.to_string(), offset.value());
        self.persist(&state)
    }

    fn stage(&self, consumer: &str, pending: PendingCommit) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.insert(consumer.to_string(), pending);
        self.persist(&state)
    }

    fn pending(&self, consumer: &str) -> Result<Option<PendingCommit>> {
        Ok(self.state.lock().pending.get(consumer).cloned())
    }

    fn clear(&self, consumer: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending.remove(consumer).is_some() {
            self.persist(&state)?;
        }
        Ok(())
    }
}

/// Scoped transaction combining a dataset's data commit with its
/// checkpoint advances.
///
/// Everything is staged until `commit`; dropping the transaction
/// uncommitted discards all staged work. On commit, the intent is
/// recorded first, then appends apply, then advances, then the intent
/// is cleared. Replay after a crash at any point re-applies the append
/// as a no-op (its offset range is already marked applied) and
/// completes the advances, so rows are never duplicated and checkpoint
/// progress is never permanently lost.
pub struct CommitTxn<'a> {
    dataset: &'a str,
    tables: &'a dyn TableStore,
    checkpoints: &'a dyn CheckpointStore,
    appends: Vec<RowBatch>,
    advances: Vec<(String, Offset)>,
}

impl<'a> CommitTxn<'a> {
    pub fn new(
        dataset: &'a str,
        tables: &'a dyn TableStore,
        checkpoints: &'a dyn CheckpointStore,
    ) -> Self {
        Self {
            dataset,
            tables,
            checkpoints,
            appends: Vec::new(),
            advances: Vec::new(),
        }
    }

    pub fn stage_append(&mut self, batch: RowBatch) {
        self.appends.push(batch);
    }

    pub fn stage_advance(&mut self, producer: impl Into<String>, offset: Offset) {
        self.advances.push((producer.into(), offset));
    }

    /// The offset span covered by all staged appends.
    fn staged_range(&self) -> Option<OffsetRange> {
        let start = self.appends.iter().map(|b| b.offsets().start).min()?;
        let end = self.appends.iter().map(|b| b.offsets().end).max()?;
        Some(OffsetRange::new(start.value(), end.value()))
    }

    /// Record the intent, apply staged appends, then staged advances,
    /// then clear the intent. Returns the number of rows newly appended
    /// (zero on pure replay).
    pub fn commit(self) -> Result<usize> {
        let staged = self.staged_range();
        if let Some(range) = staged {
            self.checkpoints.stage(
                self.dataset,
                PendingCommit {
                    range,
                    advances: self
                        .advances
                        .iter()
                        .map(|(producer, offset)| (producer.clone(), offset.value()))
                        .collect(),
                },
            )?;
        }
        let mut appended = 0;
        for batch in &self.appends {
            if self.tables.append(self.dataset, batch)? {
                appended += batch.num_rows();
            } else {
                debug!(
                    dataset = self.dataset,
                    range = %batch.offsets(),
                    "append replayed as no-op"
                );
            }
        }
        for (producer, offset) in &self.advances {
            self.checkpoints.advance(self.dataset, producer, *offset)?;
        }
        if staged.is_some() {
            self.checkpoints.clear(self.dataset)?;
        }
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::OffsetRange;
    use crate::store::MemoryTableStore;
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn batch(start: u64, values: Vec<i64>) -> RowBatch {
        let end = start + values.len() as u64;
        let data = RecordBatch::try_new(
            test_schema(),
            vec![Arc::new(Int64Array::from(values)) as ArrayRef],
        )
        .unwrap();
        RowBatch::new(data, OffsetRange::new(start, end))
    }

    fn intent(range: OffsetRange, advances: Vec<(&str, u64)>) -> PendingCommit {
        PendingCommit {
            range,
            advances: advances
                .into_iter()
                .map(|(p, o)| (p.to_string(), o))
                .collect(),
        }
    }

    #[test]
    fn test_never_consumed_sentinel() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.get("silver", "bronze").unwrap(), None);
    }

    #[test]
    fn test_advance_and_get() {
        let store = MemoryCheckpointStore::new();
        store.advance("silver", "bronze", Offset(5)).unwrap();
        assert_eq!(store.get("silver", "bronze").unwrap(), Some(Offset(5)));
        // Re-advancing to the same offset is allowed (replay).
        store.advance("silver", "bronze", Offset(5)).unwrap();
    }

    #[test]
    fn test_non_monotonic_advance_fails() {
        let store = MemoryCheckpointStore::new();
        store.advance("silver", "bronze", Offset(10)).unwrap();
        let err = store.advance("silver", "bronze", Offset(3)).unwrap_err();
        assert!(matches!(err, CascadeError::NonMonotonicOffset { .. }));
        assert!(err.is_fatal());
        // The recorded offset is untouched.
        assert_eq!(store.get("silver", "bronze").unwrap(), Some(Offset(10)));
    }

    #[test]
    fn test_stage_and_clear_intent() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.pending("silver").unwrap(), None);
        let pending = intent(OffsetRange::new(0, 2), vec![("bronze", 2)]);
        store.stage("silver", pending.clone()).unwrap();
        assert_eq!(store.pending("silver").unwrap(), Some(pending));
        store.clear("silver").unwrap();
        assert_eq!(store.pending("silver").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let pending = intent(OffsetRange::new(0, 7), vec![("bronze", 7)]);
        {
            let store = FileCheckpointStore::open(&path).unwrap();
            store.advance("silver", "bronze", Offset(7)).unwrap();
            store.advance("gold", "silver", Offset(2)).unwrap();
            store.stage("silver", pending.clone()).unwrap();
        }
        let reopened = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.get("silver", "bronze").unwrap(), Some(Offset(7)));
        assert_eq!(reopened.get("gold", "silver").unwrap(), Some(Offset(2)));
        assert_eq!(reopened.get("gold", "bronze").unwrap(), None);
        // Intents survive a restart, which is what makes interrupted
        // commits recoverable.
        assert_eq!(reopened.pending("silver").unwrap(), Some(pending));
        assert_eq!(reopened.pending("gold").unwrap(), None);
    }

    #[test]
    fn test_txn_drop_discards_staged_work() {
        let tables = MemoryTableStore::new();
        tables.register("silver", test_schema()).unwrap();
        let checkpoints = MemoryCheckpointStore::new();
        {
            let mut txn = CommitTxn::new("silver", &tables, &checkpoints);
            txn.stage_append(batch(0, vec![1, 2]));
            txn.stage_advance("bronze", Offset(2));
            // dropped uncommitted
        }
        assert_eq!(tables.num_rows("silver").unwrap(), 0);
        assert_eq!(checkpoints.get("silver", "bronze").unwrap(), None);
        assert_eq!(checkpoints.pending("silver").unwrap(), None);
    }

    #[test]
    fn test_txn_commit_applies_both_and_clears_intent() {
        let tables = MemoryTableStore::new();
        tables.register("silver", test_schema()).unwrap();
        let checkpoints = MemoryCheckpointStore::new();
        let mut txn = CommitTxn::new("silver", &tables, &checkpoints);
        txn.stage_append(batch(0, vec![1, 2]));
        txn.stage_advance("bronze", Offset(2));
        assert_eq!(txn.commit().unwrap(), 2);
        assert_eq!(tables.num_rows("silver").unwrap(), 2);
        assert_eq!(checkpoints.get("silver", "bronze").unwrap(), Some(Offset(2)));
        assert_eq!(checkpoints.pending("silver").unwrap(), None);
    }

    #[test]
    fn test_txn_replay_after_partial_commit() {
        // Simulate a crash between append and checkpoint advance, then a
        // full replay of the same cycle.
        let tables = MemoryTableStore::new();
        tables.register("silver", test_schema()).unwrap();
        let checkpoints = MemoryCheckpointStore::new();

        // First attempt: append landed, advance did not.
        tables.append("silver", &batch(0, vec![1, 2])).unwrap();

        let mut txn = CommitTxn::new("silver", &tables, &checkpoints);
        txn.stage_append(batch(0, vec![1, 2]));
        txn.stage_advance("bronze", Offset(2));
        let appended = txn.commit().unwrap();

        // Replay appended nothing new but completed the checkpoint.
        assert_eq!(appended, 0);
        assert_eq!(tables.num_rows("silver").unwrap(), 2);
        assert_eq!(checkpoints.get("silver", "bronze").unwrap(), Some(Offset(2)));
    }

    #[test]
    fn test_txn_intent_spans_all_appends() {
        let tables = MemoryTableStore::new();
        tables.register("bronze", test_schema()).unwrap();
        let checkpoints = MemoryCheckpointStore::new();
        let mut txn = CommitTxn::new("bronze", &tables, &checkpoints);
        txn.stage_append(batch(0, vec![1, 2]));
        txn.stage_append(batch(2, vec![3]));
        txn.stage_advance("/data/orders", Offset(3));
        assert_eq!(txn.staged_range(), Some(OffsetRange::new(0, 3)));
        txn.commit().unwrap();
        assert_eq!(checkpoints.pending("bronze").unwrap(), None);
    }
}
