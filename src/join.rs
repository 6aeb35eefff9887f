//! Streaming equality join with bounded state.
//!
//! Joins two incrementally-arriving inputs on an equality key, buffering
//! unmatched rows on both sides so that arbitrary arrival order is
//! handled. State is bounded by a retention window measured in source
//! offsets: the watermark is the lower of the two sides' high offsets,
//! and entries older than `watermark - offset_lag` are evicted. Evicting
//! an unmatched left row under a left-outer join emits the null-padded
//! outer row exactly once; evicting an unmatched row under an inner join
//! is a silent, documented drop.
//!
//! Each (left, right) row pair is emitted exactly once even when the
//! engine re-delivers or reorders batches: ingestion is deduplicated by
//! the batch's source offset range, never by wall-clock arrival time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array,
    Int16Array, Int32Array, Int64Array, Int8Array, StringArray, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use tracing::debug;

use crate::batch::{concat, RowBatch};
use crate::error::{CascadeError, Result};

/// Supported join types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
}

/// Which input a buffered row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

/// Extracts the join-key column from a batch.
pub type KeyFn = Arc<dyn Fn(&RecordBatch) -> Result<ArrayRef> + Send + Sync>;

/// How long unmatched state is retained, in source offsets behind the
/// watermark. Offsets are the engine's monotonic clock, so replay stays
/// deterministic.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub offset_lag: u64,
}

impl RetentionPolicy {
    pub fn offset_lag(lag: u64) -> Self {
        Self { offset_lag: lag }
    }
}

/// An exact join-key value. Null keys never match and are kept out of the
/// key index entirely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScalarKey {
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// Float bit pattern, matching the engine-wide bitwise float equality.
    FloatBits(u64),
    Utf8(String),
}

#[derive(Debug)]
struct BufferedRow {
    row: RecordBatch,
    /// Source offset used for retention decisions.
    offset: u64,
    matched: bool,
}

#[derive(Default)]
struct JoinState {
    left: HashMap<ScalarKey, Vec<BufferedRow>>,
    /// Left rows with null keys; can never match, held only for deferred
    /// outer emission.
    left_null_key: Vec<BufferedRow>,
    right: HashMap<ScalarKey, Vec<BufferedRow>>,
    /// Offset ranges already ingested per side; re-delivered batches are
    /// skipped wholesale.
    seen_left: HashSet<(u64, u64)>,
    seen_right: HashSet<(u64, u64)>,
    left_high: u64,
    right_high: u64,
    /// Highest eviction horizon so far. Rows at offsets below it are
    /// final; late re-deliveries from that region are dropped even after
    /// their seen-range entry has been pruned.
    horizon: u64,
}

/// A streaming equality join operator for one (left, right) input pair.
///
/// Thread-safe; intended to be captured by a derived dataset's transform
/// and fed from its two stream-mode reads.
pub struct StreamingJoin {
    join_type: JoinType,
    left_key: KeyFn,
    right_key: KeyFn,
    right_schema: SchemaRef,
    output_schema: SchemaRef,
    retention: RetentionPolicy,
    state: Mutex<JoinState>,
}

impl StreamingJoin {
    pub fn new<L, R>(
        join_type: JoinType,
        left_schema: SchemaRef,
        right_schema: SchemaRef,
        left_key: L,
        right_key: R,
        retention: RetentionPolicy,
    ) -> Self
    where
        L: Fn(&RecordBatch) -> Result<ArrayRef> + Send + Sync + 'static,
        R: Fn(&RecordBatch) -> Result<ArrayRef> + Send + Sync + 'static,
    {
        let output_schema = joined_schema(&left_schema, &right_schema, join_type);
        Self {
            join_type,
            left_key: Arc::new(left_key),
            right_key: Arc::new(right_key),
            right_schema,
            output_schema,
            retention,
            state: Mutex::new(JoinState::default()),
        }
    }

    /// Convenience constructor keying both sides on a named column.
    pub fn on_column(
        join_type: JoinType,
        left_schema: SchemaRef,
        right_schema: SchemaRef,
        key_column: &str,
        retention: RetentionPolicy,
    ) -> Result<Self> {
        let left_idx = left_schema.index_of(key_column)?;
        let right_idx = right_schema.index_of(key_column)?;
        Ok(Self::new(
            join_type,
            left_schema,
            right_schema,
            move |batch: &RecordBatch| Ok(Arc::clone(batch.column(left_idx))),
            move |batch: &RecordBatch| Ok(Arc::clone(batch.column(right_idx))),
            retention,
        ))
    }

    /// Schema of emitted rows: left fields then right fields (right
    /// fields nullable under a left-outer join).
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    /// Ingest new batches from both sides, emitting every newly matched
    /// pair plus any outer rows released by the advancing watermark.
    pub fn process(&self, left: &[RowBatch], right: &[RowBatch]) -> Result<Vec<RecordBatch>> {
        let mut state = self.state.lock();
        let mut emitted: Vec<RecordBatch> = Vec::new();

        for batch in left {
            self.ingest(&mut state, JoinSide::Left, batch, &mut emitted)?;
        }
        for batch in right {
            self.ingest(&mut state, JoinSide::Right, batch, &mut emitted)?;
        }

        // Watermark lags the slower side; only offsets both sides have
        // passed are final enough to evict.
        let watermark = state.left_high.min(state.right_high);
        if let Some(horizon) = watermark.checked_sub(self.retention.offset_lag) {
            self.evict(&mut state, horizon, &mut emitted)?;
        }

        self.finish(emitted)
    }

    /// Force-evict all state up to the given watermark, emitting deferred
    /// outer rows for unmatched left state under a left-outer join.
    pub fn advance_watermark(&self, watermark: u64) -> Result<Vec<RecordBatch>> {
        let mut state = self.state.lock();
        let horizon = watermark.saturating_sub(self.retention.offset_lag);
        let mut emitted = Vec::new();
        self.evict(&mut state, horizon, &mut emitted)?;
        self.finish(emitted)
    }

    /// Drain the operator at end of input: every remaining unmatched left
    /// row emits its outer row under a left-outer join.
    pub fn flush(&self) -> Result<Vec<RecordBatch>> {
        let mut state = self.state.lock();
        let mut emitted = Vec::new();
        self.evict(&mut state, u64::MAX, &mut emitted)?;
        self.finish(emitted)
    }

    /// Number of rows currently buffered across both sides.
    pub fn buffered_rows(&self) -> usize {
        let state = self.state.lock();
        state.left.values().map(Vec::len).sum::<usize>()
            + state.left_null_key.len()
            + state.right.values().map(Vec::len).sum::<usize>()
    }

    fn ingest(
        &self,
        state: &mut JoinState,
        side: JoinSide,
        batch: &RowBatch,
        emitted: &mut Vec<RecordBatch>,
    ) -> Result<()> {
        let range = batch.offsets();
        let range_key = (range.start.value(), range.end.value());
        let seen = match side {
            JoinSide::Left => &mut state.seen_left,
            JoinSide::Right => &mut state.seen_right,
        };
        if !seen.insert(range_key) {
            debug!(range = %range, ?side, "skipping re-delivered join input batch");
            return Ok(());
        }
        match side {
            JoinSide::Left => state.left_high = state.left_high.max(range.end.value()),
            JoinSide::Right => state.right_high = state.right_high.max(range.end.value()),
        }

        let key_fn = match side {
            JoinSide::Left => &self.left_key,
            JoinSide::Right => &self.right_key,
        };
        let keys = key_fn(batch.data())?;
        if keys.len() != batch.num_rows() {
            return Err(CascadeError::invalid_argument(format!(
                "join key extractor returned {} values for {} rows",
                keys.len(),
                batch.num_rows()
            )));
        }
        // Offsets within a dense batch are per-row; sparse (derived)
        // ranges fall back to batch granularity.
        let dense = range.len() == batch.num_rows() as u64;

        for row_idx in 0..batch.num_rows() {
            let row = batch.slice_row(row_idx);
            let offset = if dense {
                range.start.value() + row_idx as u64
            } else {
                range.start.value()
            };
            // The region below the horizon was already finalized;
            // re-admitting a row from it would re-emit pairs whose dedup
            // record has been pruned.
            if offset < state.horizon {
                continue;
            }
            let key = scalar_key(&keys, row_idx)?;

            match side {
                JoinSide::Left => {
                    let mut matched = false;
                    if let Some(key) = &key {
                        if let Some(partners) = state.right.get(key) {
                            for partner in partners {
                                emitted.push(self.emit_pair(&row, &partner.row)?);
                                matched = true;
                            }
                        }
                    }
                    let entry = BufferedRow {
                        row,
                        offset,
                        matched,
                    };
                    match key {
                        Some(key) => state.left.entry(key).or_default().push(entry),
                        None => state.left_null_key.push(entry),
                    }
                }
                JoinSide::Right => {
                    if let Some(key) = &key {
                        if let Some(partners) = state.left.get_mut(key) {
                            for partner in partners.iter_mut() {
                                emitted.push(self.emit_pair(&partner.row, &row)?);
                                partner.matched = true;
                            }
                        }
                        state.right.entry(key.clone()).or_default().push(BufferedRow {
                            row,
                            offset,
                            matched: false,
                        });
                    }
                    // Null right keys can never match anything; an inner
                    // or left-outer join has no use for them.
                }
            }
        }
        Ok(())
    }

    /// Evict entries with offsets strictly below the horizon. Pruning the
    /// seen-range sets to the same horizon keeps dedup memory bounded;
    /// rows past the horizon are final and never revisited.
    fn evict(
        &self,
        state: &mut JoinState,
        horizon: u64,
        emitted: &mut Vec<RecordBatch>,
    ) -> Result<()> {
        if horizon == 0 {
            return Ok(());
        }
        let mut evicted_unmatched = 0usize;
        let mut outer_rows: Vec<RecordBatch> = Vec::new();

        for rows in state.left.values_mut() {
            let mut kept = Vec::with_capacity(rows.len());
            for entry in rows.drain(..) {
                if entry.offset < horizon {
                    if !entry.matched {
                        evicted_unmatched += 1;
                        if self.join_type == JoinType::LeftOuter {
                            outer_rows.push(self.emit_outer(&entry.row)?);
                        }
                    }
                } else {
                    kept.push(entry);
                }
            }
            *rows = kept;
        }
        state.left.retain(|_, rows| !rows.is_empty());

        let mut kept_null = Vec::with_capacity(state.left_null_key.len());
        for entry in state.left_null_key.drain(..) {
            if entry.offset < horizon {
                evicted_unmatched += 1;
                if self.join_type == JoinType::LeftOuter {
                    outer_rows.push(self.emit_outer(&entry.row)?);
                }
            } else {
                kept_null.push(entry);
            }
        }
        state.left_null_key = kept_null;

        for rows in state.right.values_mut() {
            rows.retain(|entry| {
                if entry.offset < horizon {
                    evicted_unmatched += 1;
                    false
                } else {
                    true
                }
            });
        }
        state.right.retain(|_, rows| !rows.is_empty());

        state.seen_left.retain(|&(_, end)| end >= horizon);
        state.seen_right.retain(|&(_, end)| end >= horizon);
        state.horizon = state.horizon.max(horizon);

        if evicted_unmatched > 0 {
            debug!(
                horizon,
                evicted = evicted_unmatched,
                outer_emitted = outer_rows.len(),
                "evicted join state past retention window"
            );
        }
        emitted.append(&mut outer_rows);
        Ok(())
    }

    fn emit_pair(&self, left_row: &RecordBatch, right_row: &RecordBatch) -> Result<RecordBatch> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.output_schema.fields().len());
        columns.extend(left_row.columns().iter().cloned());
        columns.extend(right_row.columns().iter().cloned());
        Ok(RecordBatch::try_new(
            Arc::clone(&self.output_schema),
            columns,
        )?)
    }

    fn emit_outer(&self, left_row: &RecordBatch) -> Result<RecordBatch> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.output_schema.fields().len());
        columns.extend(left_row.columns().iter().cloned());
        for field in self.right_schema.fields() {
            columns.push(new_null_array(field.data_type(), 1));
        }
        Ok(RecordBatch::try_new(
            Arc::clone(&self.output_schema),
            columns,
        )?)
    }

    fn finish(&self, emitted: Vec<RecordBatch>) -> Result<Vec<RecordBatch>> {
        if emitted.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![concat(&self.output_schema, &emitted)?])
    }
}

/// Output schema of a join: left fields then right fields. Under a
/// left-outer join the right fields become nullable, since outer rows
/// pad them with nulls.
fn joined_schema(left: &SchemaRef, right: &SchemaRef, join_type: JoinType) -> SchemaRef {
    let mut fields: Vec<Field> = left.fields().iter().map(|f| f.as_ref().clone()).collect();
    for field in right.fields() {
        let field = field.as_ref().clone();
        if join_type == JoinType::LeftOuter {
            fields.push(field.with_nullable(true));
        } else {
            fields.push(field);
        }
    }
    Arc::new(Schema::new(fields))
}

/// Extract the exact key value at one row. Returns `None` for null keys,
/// which never participate in matching.
fn scalar_key(array: &ArrayRef, row: usize) -> Result<Option<ScalarKey>> {
    if array.is_null(row) {
        return Ok(None);
    }
    let key = match array.data_type() {
        DataType::Boolean => {
            ScalarKey::Bool(downcast::<BooleanArray>(array, "BooleanArray")?.value(row))
        }
        DataType::Int8 => {
            ScalarKey::Int(downcast::<Int8Array>(array, "Int8Array")?.value(row) as i64)
        }
        DataType::Int16 => {
            ScalarKey::Int(downcast::<Int16Array>(array, "Int16Array")?.value(row) as i64)
        }
        DataType::Int32 => {
            ScalarKey::Int(downcast::<Int32Array>(array, "Int32Array")?.value(row) as i64)
        }
        DataType::Int64 => ScalarKey::Int(downcast::<Int64Array>(array, "Int64Array")?.value(row)),
        DataType::UInt32 => {
            ScalarKey::UInt(downcast::<UInt32Array>(array, "UInt32Array")?.value(row) as u64)
        }
        DataType::UInt64 => {
            ScalarKey::UInt(downcast::<UInt64Array>(array, "UInt64Array")?.value(row))
        }
        DataType::Float32 => ScalarKey::FloatBits(
            downcast::<Float32Array>(array, "Float32Array")?.value(row).to_bits() as u64,
        ),
        DataType::Float64 => ScalarKey::FloatBits(
            downcast::<Float64Array>(array, "Float64Array")?.value(row).to_bits(),
        ),
        DataType::Utf8 => {
            ScalarKey::Utf8(downcast::<StringArray>(array, "StringArray")?.value(row).to_string())
        }
        DataType::Date32 => {
            ScalarKey::Int(downcast::<Date32Array>(array, "Date32Array")?.value(row) as i64)
        }
        dt => {
            return Err(CascadeError::invalid_argument(format!(
                "unsupported join key type {dt:?}"
            )));
        }
    };
    Ok(Some(key))
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, expected: &str) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        CascadeError::internal(format!(
            "failed to downcast array to {expected}, actual type {:?}",
            array.data_type()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::OffsetRange;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn orders_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("order_id", DataType::Int64, false),
            Field::new("customer_id", DataType::Utf8, false),
        ]))
    }

    fn customers_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("customer_id", DataType::Utf8, false),
            Field::new("name", DataType::Utf8, false),
        ]))
    }

    fn orders(start: u64, rows: Vec<(i64, &str)>) -> RowBatch {
        let end = start + rows.len() as u64;
        let (ids, custs): (Vec<i64>, Vec<&str>) = rows.into_iter().unzip();
        let batch = RecordBatch::try_new(
            orders_schema(),
            vec![
                Arc::new(Int64Array::from(ids)) as ArrayRef,
                Arc::new(StringArray::from(custs)) as ArrayRef,
            ],
        )
        .unwrap();
        RowBatch::new(batch, OffsetRange::new(start, end))
    }

    fn customers(start: u64, rows: Vec<(&str, &str)>) -> RowBatch {
        let end = start + rows.len() as u64;
        let (ids, names): (Vec<&str>, Vec<&str>) = rows.into_iter().unzip();
        let batch = RecordBatch::try_new(
            customers_schema(),
            vec![
                Arc::new(StringArray::from(ids)) as ArrayRef,
                Arc::new(StringArray::from(names)) as ArrayRef,
            ],
        )
        .unwrap();
        RowBatch::new(batch, OffsetRange::new(start, end))
    }

    fn join(join_type: JoinType, lag: u64) -> StreamingJoin {
        StreamingJoin::on_column(
            join_type,
            orders_schema(),
            customers_schema(),
            "customer_id",
            RetentionPolicy::offset_lag(lag),
        )
        .unwrap()
    }

    fn total_rows(batches: &[RecordBatch]) -> usize {
        batches.iter().map(RecordBatch::num_rows).sum()
    }

    #[test]
    fn test_inner_join_matches_across_arrival_order() {
        let op = join(JoinType::Inner, 100);
        // Left arrives before its match exists.
        let out = op.process(&[orders(0, vec![(1, "A")])], &[]).unwrap();
        assert_eq!(total_rows(&out), 0);
        // Right arrives; the pair emits.
        let out = op.process(&[], &[customers(0, vec![("A", "Alice")])]).unwrap();
        assert_eq!(total_rows(&out), 1);
    }

    #[test]
    fn test_exactly_once_pairing_under_redelivery() {
        let op = join(JoinType::Inner, 100);
        let left = orders(0, vec![(1, "A"), (2, "A")]);
        let right = customers(0, vec![("A", "Alice")]);

        let mut total = 0;
        total += total_rows(&op.process(&[left.clone()], &[right.clone()]).unwrap());
        // Re-deliver both batches; nothing new may emit.
        total += total_rows(&op.process(&[left.clone()], &[right.clone()]).unwrap());
        total += total_rows(&op.process(&[left], &[right]).unwrap());
        assert_eq!(total, 2);
    }

    #[test]
    fn test_exactly_once_pairing_any_interleaving() {
        // Two streams of offsets 0..4 sharing key "K": all 16 pairs
        // appear exactly once, regardless of delivery order.
        let deliveries: Vec<(bool, u64)> = vec![
            (true, 0),
            (false, 0),
            (false, 1),
            (true, 1),
            (true, 2),
            (true, 3),
            (false, 2),
            (false, 3),
        ];
        let op = join(JoinType::Inner, 1000);
        let mut total = 0;
        for (is_left, offset) in deliveries {
            let out = if is_left {
                op.process(&[orders(offset, vec![(offset as i64, "K")])], &[])
                    .unwrap()
            } else {
                op.process(&[], &[customers(offset, vec![("K", "name")])])
                    .unwrap()
            };
            total += total_rows(&out);
        }
        assert_eq!(total, 16);
    }

    #[test]
    fn test_left_outer_emits_null_padded_row_on_eviction() {
        let op = join(JoinType::LeftOuter, 0);
        let out = op
            .process(&[orders(0, vec![(1, "ZZ")])], &[customers(0, vec![("A", "Alice")])])
            .unwrap();
        // Watermark is 1 on both sides with zero lag: the unmatched left
        // row ages out and emits its outer row.
        assert_eq!(total_rows(&out), 1);
        let batch = &out[0];
        let names = batch
            .column(3)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert!(names.is_null(0));
    }

    #[test]
    fn test_left_outer_match_suppresses_outer_emission() {
        let op = join(JoinType::LeftOuter, 100);
        let matched = op
            .process(&[orders(0, vec![(1, "A")])], &[customers(0, vec![("A", "Alice")])])
            .unwrap();
        assert_eq!(total_rows(&matched), 1);
        // Flushing must not re-emit the matched row as an outer row.
        let flushed = op.flush().unwrap();
        assert_eq!(total_rows(&flushed), 0);
    }

    #[test]
    fn test_inner_eviction_is_silent_drop() {
        let op = join(JoinType::Inner, 0);
        let out = op
            .process(&[orders(0, vec![(1, "ZZ")])], &[customers(0, vec![("A", "Alice")])])
            .unwrap();
        assert_eq!(total_rows(&out), 0);
        assert_eq!(op.buffered_rows(), 0);
        // A late match for the evicted row never emits.
        let late = op.process(&[], &[customers(1, vec![("ZZ", "Zed")])]).unwrap();
        assert_eq!(total_rows(&late), 0);
    }

    #[test]
    fn test_redelivery_after_seen_pruning_never_reemits() {
        let op = join(JoinType::Inner, 0);
        let left0 = orders(0, vec![(1, "A")]);
        // Two rounds push the horizon to 2, which prunes the dedup record
        // for the offset-0 batches on both sides.
        op.process(&[left0.clone()], &[customers(0, vec![("B", "Bea")])])
            .unwrap();
        op.process(&[orders(1, vec![(2, "C")])], &[customers(1, vec![("D", "Dana")])])
            .unwrap();
        // A live right row for key "A" arrives, then the old left batch
        // is re-delivered: its region is final and must stay silent.
        op.process(&[], &[customers(2, vec![("A", "Alice")])]).unwrap();
        let out = op.process(&[left0], &[]).unwrap();
        assert_eq!(total_rows(&out), 0);
        assert_eq!(op.buffered_rows(), 1);
    }

    #[test]
    fn test_retention_bounds_state() {
        let op = join(JoinType::Inner, 2);
        for offset in 0..10u64 {
            op.process(
                &[orders(offset, vec![(offset as i64, "no_match")])],
                &[customers(offset, vec![("other", "x")])],
            )
            .unwrap();
        }
        // Only entries within the lag window survive, on both sides.
        assert!(op.buffered_rows() <= 2 * 2 + 2);
    }

    #[test]
    fn test_flush_emits_remaining_outer_rows() {
        let op = join(JoinType::LeftOuter, 1000);
        op.process(&[orders(0, vec![(1, "A"), (2, "B")])], &[])
            .unwrap();
        let out = op.flush().unwrap();
        assert_eq!(total_rows(&out), 2);
        assert_eq!(op.buffered_rows(), 0);
    }

    #[test]
    fn test_multiple_matches_per_key() {
        let op = join(JoinType::Inner, 1000);
        let out1 = op
            .process(
                &[orders(0, vec![(1, "A"), (2, "A")])],
                &[customers(0, vec![("A", "Alice")])],
            )
            .unwrap();
        assert_eq!(total_rows(&out1), 2);
        // A second right row for the same key matches both buffered left
        // rows again (new pairs, not duplicates).
        let out2 = op
            .process(&[], &[customers(1, vec![("A", "Alicia")])])
            .unwrap();
        assert_eq!(total_rows(&out2), 2);
    }
}
