//! Row batches and source offsets.
//!
//! Rows travel through the engine as Arrow `RecordBatch`es wrapped with the
//! offset range they represent in their producing dataset. Batches are
//! append-only and immutable once emitted; offset ranges are the identity
//! used for idempotent appends and checkpoint advancement.

use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A position in a dataset's append sequence. Offsets increase
/// monotonically but are not required to be dense.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Offset(pub u64);

impl Offset {
    /// The zero offset (nothing consumed yet).
    pub const ZERO: Offset = Offset(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open offset range `[start, end)` identifying the span of a
/// producing dataset that a batch represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetRange {
    pub start: Offset,
    pub end: Offset,
}

impl OffsetRange {
    /// Panics if `start > end`; a reversed range would otherwise corrupt
    /// dedup keys and underflow `len`.
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "offset range start must not exceed end");
        Self {
            start: Offset(start),
            end: Offset(end),
        }
    }

    /// Number of offsets covered. Equals the row count only for dense
    /// ranges (raw source batches); derived commits may span more.
    pub fn len(&self) -> u64 {
        self.end.0 - self.start.0
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl std::fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// An ordered batch of rows tagged with the offset range it represents.
#[derive(Debug, Clone)]
pub struct RowBatch {
    data: RecordBatch,
    offsets: OffsetRange,
}

impl RowBatch {
    pub fn new(data: RecordBatch, offsets: OffsetRange) -> Self {
        Self { data, offsets }
    }

    pub fn data(&self) -> &RecordBatch {
        &self.data
    }

    pub fn into_data(self) -> RecordBatch {
        self.data
    }

    pub fn offsets(&self) -> OffsetRange {
        self.offsets
    }

    pub fn num_rows(&self) -> usize {
        self.data.num_rows()
    }

    pub fn schema(&self) -> SchemaRef {
        self.data.schema()
    }

    /// A one-row view of this batch. Panics if `row` is out of bounds,
    /// matching `RecordBatch::slice` semantics.
    pub fn slice_row(&self, row: usize) -> RecordBatch {
        self.data.slice(row, 1)
    }
}

/// Concatenate record batches under a shared schema. Empty input yields
/// an empty batch of that schema.
pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::clone(schema)));
    }
    Ok(concat_batches(schema, batches)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};

    fn int_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(values)) as ArrayRef],
        )
        .unwrap()
    }

    #[test]
    fn test_offset_range_len() {
        let range = OffsetRange::new(5, 9);
        assert_eq!(range.len(), 4);
        assert!(!range.is_empty());
        assert!(OffsetRange::new(3, 3).is_empty());
    }

    #[test]
    #[should_panic(expected = "offset range start must not exceed end")]
    fn test_reversed_offset_range_rejected() {
        OffsetRange::new(4, 2);
    }

    #[test]
    fn test_row_batch_slice() {
        let batch = RowBatch::new(int_batch(vec![10, 20, 30]), OffsetRange::new(0, 3));
        assert_eq!(batch.num_rows(), 3);
        let row = batch.slice_row(1);
        assert_eq!(row.num_rows(), 1);
        let col = row
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(col.value(0), 20);
    }

    #[test]
    fn test_concat_empty_input() {
        let schema: SchemaRef =
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let out = concat(&schema, &[]).unwrap();
        assert_eq!(out.num_rows(), 0);
        assert_eq!(out.schema(), schema);
    }

    #[test]
    fn test_concat_batches() {
        let schema = int_batch(vec![1]).schema();
        let out = concat(&schema, &[int_batch(vec![1, 2]), int_batch(vec![3])]).unwrap();
        assert_eq!(out.num_rows(), 3);
    }
}
