//! Row-level constraint enforcement.
//!
//! Constraints evaluate in declaration order against a candidate output
//! batch. All fail-update checks run before any drop is applied, so a
//! rejected batch commits nothing; drop-row constraints compose by mask
//! intersection; observe-only constraints count without filtering.
//! Violation records are immutable once created and accumulate into
//! [`ConstraintMetrics`] for observability.

use std::collections::HashMap;

use arrow::array::{Array, BooleanArray};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use crate::dataset::{Constraint, ViolationPolicy};
use crate::error::Result;

/// Outcome of evaluating a dataset's constraints for one cycle.
#[derive(Debug)]
pub enum EnforcementOutcome {
    /// The surviving rows after any drop-row filtering.
    Passed(RecordBatch),
    /// A fail-update constraint rejected the batch; nothing commits.
    Rejected {
        constraint: String,
        violations: usize,
        total: usize,
    },
}

/// One constraint's violation counts for one cycle. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    pub dataset: String,
    pub constraint: String,
    pub cycle_id: u64,
    pub violated_rows: usize,
    pub total_rows: usize,
}

/// Evaluate constraints over a candidate batch.
///
/// Returns the outcome plus a violation record per constraint that saw at
/// least one violating row. A null predicate result counts as a violation
/// for that row.
pub fn evaluate(
    dataset: &str,
    cycle_id: u64,
    batch: &RecordBatch,
    constraints: &[Constraint],
) -> Result<(EnforcementOutcome, Vec<ViolationRecord>)> {
    let total = batch.num_rows();
    if constraints.is_empty() || total == 0 {
        return Ok((EnforcementOutcome::Passed(batch.clone()), Vec::new()));
    }

    let mut records = Vec::new();
    let mut keep = vec![true; total];
    let mut rejection: Option<(String, usize)> = None;

    for constraint in constraints {
        let mask = (constraint.predicate)(batch)?;
        if mask.len() != total {
            return Err(crate::error::CascadeError::invalid_argument(format!(
                "predicate '{}' for dataset '{dataset}' returned {} rows, expected {total}",
                constraint.name,
                mask.len()
            )));
        }

        let mut violated = 0usize;
        for row in 0..total {
            let passes = !mask.is_null(row) && mask.value(row);
            if !passes {
                violated += 1;
                if constraint.policy == ViolationPolicy::DropRow {
                    keep[row] = false;
                }
            }
        }

        if violated > 0 {
            records.push(ViolationRecord {
                dataset: dataset.to_string(),
                constraint: constraint.name.clone(),
                cycle_id,
                violated_rows: violated,
                total_rows: total,
            });
            if constraint.policy == ViolationPolicy::FailUpdate && rejection.is_none() {
                rejection = Some((constraint.name.clone(), violated));
            }
        }
    }

    if let Some((constraint, violations)) = rejection {
        return Ok((
            EnforcementOutcome::Rejected {
                constraint,
                violations,
                total,
            },
            records,
        ));
    }

    let surviving = if keep.iter().all(|&k| k) {
        batch.clone()
    } else {
        let mask = BooleanArray::from(keep);
        filter_record_batch(batch, &mask)?
    };
    Ok((EnforcementOutcome::Passed(surviving), records))
}

/// Running violation totals per (dataset, constraint), plus the retained
/// per-cycle records. Read-only to observability collaborators.
#[derive(Debug, Default)]
pub struct ConstraintMetrics {
    inner: Mutex<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    records: Vec<ViolationRecord>,
    totals: HashMap<(String, String), u64>,
}

impl ConstraintMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, record: ViolationRecord) {
        let mut inner = self.inner.lock();
        *inner
            .totals
            .entry((record.dataset.clone(), record.constraint.clone()))
            .or_default() += record.violated_rows as u64;
        inner.records.push(record);
    }

    /// All retained violation records, oldest first.
    pub fn records(&self) -> Vec<ViolationRecord> {
        self.inner.lock().records.clone()
    }

    /// Running violation total for one constraint.
    pub fn total_violations(&self, dataset: &str, constraint: &str) -> u64 {
        self.inner
            .lock()
            .totals
            .get(&(dataset.to_string(), constraint.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Drain retained records, e.g. after export to an external sink.
    pub fn take_records(&self) -> Vec<ViolationRecord> {
        std::mem::take(&mut self.inner.lock().records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, BooleanArray, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch_of(values: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "order_number",
            DataType::Int64,
            true,
        )]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(values)) as ArrayRef],
        )
        .unwrap()
    }

    fn non_null_order_number(policy: ViolationPolicy) -> Constraint {
        Constraint::new("valid_order_number", policy, |batch| {
            let col = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            Ok(BooleanArray::from(
                (0..col.len()).map(|i| !col.is_null(i)).collect::<Vec<_>>(),
            ))
        })
    }

    #[test]
    fn test_drop_row_filters_and_counts() {
        // 10 rows, 3 violating.
        let batch = batch_of(vec![
            Some(1),
            None,
            Some(3),
            Some(4),
            None,
            Some(6),
            Some(7),
            None,
            Some(9),
            Some(10),
        ]);
        let (outcome, records) = evaluate(
            "orders",
            1,
            &batch,
            &[non_null_order_number(ViolationPolicy::DropRow)],
        )
        .unwrap();
        match outcome {
            EnforcementOutcome::Passed(surviving) => assert_eq!(surviving.num_rows(), 7),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].violated_rows, 3);
        assert_eq!(records[0].total_rows, 10);
    }

    #[test]
    fn test_fail_update_rejects_whole_batch() {
        let batch = batch_of(vec![Some(1), None]);
        let (outcome, records) = evaluate(
            "orders",
            1,
            &batch,
            &[non_null_order_number(ViolationPolicy::FailUpdate)],
        )
        .unwrap();
        match outcome {
            EnforcementOutcome::Rejected {
                constraint,
                violations,
                total,
            } => {
                assert_eq!(constraint, "valid_order_number");
                assert_eq!(violations, 1);
                assert_eq!(total, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_fail_update_checked_before_drops() {
        // The drop-row constraint passes everything through; the
        // fail-update declared second still rejects.
        let batch = batch_of(vec![None, Some(2)]);
        let constraints = vec![
            non_null_order_number(ViolationPolicy::DropRow),
            Constraint::new("never_null", ViolationPolicy::FailUpdate, |batch| {
                let col = batch
                    .column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap();
                Ok(BooleanArray::from(
                    (0..col.len()).map(|i| !col.is_null(i)).collect::<Vec<_>>(),
                ))
            }),
        ];
        let (outcome, _) = evaluate("orders", 1, &batch, &constraints).unwrap();
        assert!(matches!(outcome, EnforcementOutcome::Rejected { .. }));
    }

    #[test]
    fn test_observe_retains_rows() {
        let batch = batch_of(vec![Some(1), None, None]);
        let (outcome, records) = evaluate(
            "orders",
            7,
            &batch,
            &[non_null_order_number(ViolationPolicy::Observe)],
        )
        .unwrap();
        match outcome {
            EnforcementOutcome::Passed(surviving) => assert_eq!(surviving.num_rows(), 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(records[0].violated_rows, 2);
        assert_eq!(records[0].cycle_id, 7);
    }

    #[test]
    fn test_multiple_drop_constraints_intersect() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![1, 2, 3, 4])) as ArrayRef],
        )
        .unwrap();
        let at_least_two = Constraint::new("ge_two", ViolationPolicy::DropRow, |batch| {
            let col = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            Ok(BooleanArray::from(
                (0..col.len()).map(|i| col.value(i) >= 2).collect::<Vec<_>>(),
            ))
        });
        let at_most_three = Constraint::new("le_three", ViolationPolicy::DropRow, |batch| {
            let col = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            Ok(BooleanArray::from(
                (0..col.len()).map(|i| col.value(i) <= 3).collect::<Vec<_>>(),
            ))
        });
        let (outcome, records) =
            evaluate("nums", 1, &batch, &[at_least_two, at_most_three]).unwrap();
        match outcome {
            EnforcementOutcome::Passed(surviving) => assert_eq!(surviving.num_rows(), 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_metrics_accumulate() {
        let metrics = ConstraintMetrics::new();
        metrics.record(ViolationRecord {
            dataset: "orders".into(),
            constraint: "valid".into(),
            cycle_id: 1,
            violated_rows: 2,
            total_rows: 10,
        });
        metrics.record(ViolationRecord {
            dataset: "orders".into(),
            constraint: "valid".into(),
            cycle_id: 2,
            violated_rows: 3,
            total_rows: 8,
        });
        assert_eq!(metrics.total_violations("orders", "valid"), 5);
        assert_eq!(metrics.records().len(), 2);
        assert_eq!(metrics.take_records().len(), 2);
        assert!(metrics.records().is_empty());
        // Totals survive draining records.
        assert_eq!(metrics.total_violations("orders", "valid"), 5);
    }
}
