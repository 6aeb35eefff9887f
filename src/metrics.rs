//! Cycle reports and observability sinks.
//!
//! Each cycle produces a [`CycleReport`] with per-dataset statuses and
//! the constraint violations observed; reports and violation records fan
//! out to registered [`MetricsSink`]s. The default sink logs through
//! `tracing`.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::constraints::ViolationRecord;

/// Terminal per-cycle status of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetStatus {
    /// Evaluated and durably committed; `rows` counts newly persisted
    /// rows (zero on replay or empty output).
    Committed { rows: usize },
    /// Evaluation failed; the dataset stays at its last committed state
    /// and is retried next cycle.
    Failed { error: String },
    /// No new upstream input, or the cycle was cancelled before this
    /// dataset's layer.
    Skipped,
}

impl DatasetStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one full pass over the dataset DAG.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Per-dataset status in topological evaluation order.
    pub statuses: Vec<(String, DatasetStatus)>,
    pub violations: Vec<ViolationRecord>,
    /// True if the cycle was cancelled before completing every layer.
    pub cancelled: bool,
}

impl CycleReport {
    pub fn status_of(&self, dataset: &str) -> Option<&DatasetStatus> {
        self.statuses
            .iter()
            .find(|(name, _)| name == dataset)
            .map(|(_, status)| status)
    }

    pub fn committed_rows(&self, dataset: &str) -> usize {
        match self.status_of(dataset) {
            Some(DatasetStatus::Committed { rows }) => *rows,
            _ => 0,
        }
    }

    pub fn any_failed(&self) -> bool {
        self.statuses.iter().any(|(_, s)| s.is_failed())
    }
}

/// Receives cycle reports and violation records for external
/// observability tooling.
pub trait MetricsSink: Send + Sync {
    fn record_cycle(&self, report: &CycleReport);
    fn record_violation(&self, record: &ViolationRecord);
}

/// Default sink: structured log lines via `tracing`.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_cycle(&self, report: &CycleReport) {
        let committed = report
            .statuses
            .iter()
            .filter(|(_, s)| matches!(s, DatasetStatus::Committed { .. }))
            .count();
        let failed = report.statuses.iter().filter(|(_, s)| s.is_failed()).count();
        let skipped = report
            .statuses
            .iter()
            .filter(|(_, s)| matches!(s, DatasetStatus::Skipped))
            .count();
        info!(
            cycle = report.cycle_id,
            committed,
            failed,
            skipped,
            cancelled = report.cancelled,
            "cycle finished"
        );
    }

    fn record_violation(&self, record: &ViolationRecord) {
        warn!(
            dataset = %record.dataset,
            constraint = %record.constraint,
            cycle = record.cycle_id,
            violated = record.violated_rows,
            total = record.total_rows,
            "constraint violations"
        );
    }
}
