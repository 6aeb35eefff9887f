//! Incremental execution engine.
//!
//! Drives repeated evaluation cycles over the dataset DAG. Each cycle
//! walks the topological layers, decides per dataset whether new upstream
//! input exists, re-evaluates only those datasets, enforces constraints,
//! and commits surviving rows together with checkpoint advances in one
//! transaction. Datasets inside one layer share no edges and may be
//! evaluated by parallel worker threads; layers are strictly ordered.
//!
//! Failure isolation: a failed dataset keeps its last committed state and
//! is retried next cycle; its dependents simply see no fresh input.
//! Failures repeating beyond the configured threshold escalate to a
//! fatal, run-stopping error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use arrow::record_batch::RecordBatch;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::batch::{concat, Offset, OffsetRange, RowBatch};
use crate::checkpoint::{CheckpointStore, CommitTxn, PendingCommit};
use crate::constraints::{self, ConstraintMetrics, EnforcementOutcome, ViolationRecord};
use crate::dataset::{AccessMode, Dataset, DatasetKind, TransformContext};
use crate::error::{CascadeError, Result};
use crate::graph::DependencyGraph;
use crate::metrics::{CycleReport, DatasetStatus, MetricsSink};
use crate::registry::FrozenRegistry;
use crate::store::{SourceReader, TableStore};

/// Cooperative cancellation flag, checked between DAG layers. A running
/// transform is never interrupted; a cancelled cycle leaves every
/// dataset at its last committed state.
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consecutive per-dataset failures tolerated before the run aborts.
    pub max_consecutive_failures: usize,
    /// Evaluate datasets within a layer on parallel worker threads.
    pub parallel_layers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            parallel_layers: true,
        }
    }
}

/// Per-dataset runtime state surviving across cycles.
#[derive(Debug, Default)]
struct DatasetRuntime {
    committed_once: AtomicBool,
    consecutive_failures: AtomicUsize,
    invocations: AtomicU64,
    /// Content versions of snapshot-mode upstreams as of the last
    /// successful evaluation, keyed by producer index.
    snapshot_versions: Mutex<HashMap<usize, u64>>,
}

struct EvalOutcome {
    status: DatasetStatus,
    violations: Vec<ViolationRecord>,
    fatal: Option<CascadeError>,
}

impl EvalOutcome {
    fn skipped() -> Self {
        Self {
            status: DatasetStatus::Skipped,
            violations: Vec::new(),
            fatal: None,
        }
    }
}

/// The cycle-driving engine. All shared state is internally synchronized;
/// a second concurrent `run_cycle` is refused rather than serialized.
pub struct IncrementalEngine {
    registry: Arc<FrozenRegistry>,
    graph: Arc<DependencyGraph>,
    tables: Arc<dyn TableStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    source_reader: Arc<dyn SourceReader>,
    sinks: Vec<Arc<dyn MetricsSink>>,
    constraint_metrics: Arc<ConstraintMetrics>,
    cancellation: Arc<CancellationToken>,
    config: EngineConfig,
    cycle_counter: AtomicU64,
    cycle_lock: Mutex<()>,
    runtime: Vec<DatasetRuntime>,
}

impl IncrementalEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<FrozenRegistry>,
        graph: Arc<DependencyGraph>,
        tables: Arc<dyn TableStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        source_reader: Arc<dyn SourceReader>,
        sinks: Vec<Arc<dyn MetricsSink>>,
        constraint_metrics: Arc<ConstraintMetrics>,
        cancellation: Arc<CancellationToken>,
        config: EngineConfig,
    ) -> Self {
        let runtime = (0..registry.len()).map(|_| DatasetRuntime::default()).collect();
        Self {
            registry,
            graph,
            tables,
            checkpoints,
            source_reader,
            sinks,
            constraint_metrics,
            cancellation,
            config,
            cycle_counter: AtomicU64::new(0),
            cycle_lock: Mutex::new(()),
            runtime,
        }
    }

    /// Number of times a dataset's transform (or source poll) has been
    /// invoked. Lets callers observe the skip optimization.
    pub fn transform_invocations(&self, dataset: &str) -> Result<u64> {
        let idx = self.registry.index_of(dataset)?;
        Ok(self.runtime[idx].invocations.load(Ordering::SeqCst))
    }

    /// Run one evaluation cycle over the full DAG.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .ok_or(CascadeError::CycleInProgress)?;
        let cycle_id = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();
        debug!(cycle = cycle_id, "cycle started");

        let mut statuses: Vec<Option<DatasetStatus>> = vec![None; self.registry.len()];
        let mut violations: Vec<ViolationRecord> = Vec::new();
        let mut cancelled = false;

        for layer in self.graph.layers() {
            if self.cancellation.is_cancelled() {
                warn!(cycle = cycle_id, "cycle cancelled between layers");
                cancelled = true;
                break;
            }
            let outcomes = self.evaluate_layer(layer, cycle_id);
            for (idx, outcome) in outcomes {
                for record in &outcome.violations {
                    self.constraint_metrics.record(record.clone());
                    for sink in &self.sinks {
                        sink.record_violation(record);
                    }
                }
                violations.extend(outcome.violations);
                statuses[idx] = Some(outcome.status);
                if let Some(fatal) = outcome.fatal {
                    return Err(fatal);
                }
            }
        }

        let statuses = self
            .graph
            .topo_order()
            .iter()
            .map(|&idx| {
                (
                    self.registry.get(idx).name().to_string(),
                    statuses[idx].take().unwrap_or(DatasetStatus::Skipped),
                )
            })
            .collect();

        let report = CycleReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            statuses,
            violations,
            cancelled,
        };
        for sink in &self.sinks {
            sink.record_cycle(&report);
        }
        info!(
            cycle = cycle_id,
            cancelled,
            failed = report.any_failed(),
            "cycle finished"
        );
        Ok(report)
    }

    fn evaluate_layer(&self, layer: &[usize], cycle_id: u64) -> Vec<(usize, EvalOutcome)> {
        if !self.config.parallel_layers || layer.len() == 1 {
            return layer
                .iter()
                .map(|&idx| (idx, self.evaluate_guarded(idx, cycle_id)))
                .collect();
        }
        thread::scope(|scope| {
            let handles: Vec<_> = layer
                .iter()
                .map(|&idx| (idx, scope.spawn(move || self.evaluate_guarded(idx, cycle_id))))
                .collect();
            handles
                .into_iter()
                .map(|(idx, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        self.record_failure(
                            idx,
                            self.registry.get(idx),
                            cycle_id,
                            CascadeError::internal("evaluation thread panicked"),
                        )
                    });
                    (idx, outcome)
                })
                .collect()
        })
    }

    /// Contain a panicking transform. A panic is a per-dataset failure
    /// counted against the escalation threshold, never a torn-down
    /// cycle: the dataset keeps its last committed state and its
    /// siblings in the layer are unaffected.
    fn evaluate_guarded(&self, idx: usize, cycle_id: u64) -> EvalOutcome {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.evaluate_dataset(idx, cycle_id)
        }))
        .unwrap_or_else(|_| {
            self.record_failure(
                idx,
                self.registry.get(idx),
                cycle_id,
                CascadeError::internal("dataset evaluation panicked"),
            )
        })
    }

    /// Evaluate one dataset for one cycle: `Pending -> Evaluating ->
    /// {Committed, Failed, Skipped}`.
    fn evaluate_dataset(&self, idx: usize, cycle_id: u64) -> EvalOutcome {
        let dataset = self.registry.get(idx);
        let result = match dataset.kind() {
            DatasetKind::SourceIncremental {
                location,
                format,
                options,
            } => self.evaluate_source(idx, dataset, location, format, options, cycle_id),
            DatasetKind::DerivedIncremental => self.evaluate_derived(idx, dataset, cycle_id),
            DatasetKind::FullRefresh => self.evaluate_full_refresh(idx, dataset, cycle_id),
            // Views have no cycle-time evaluation; they are computed at
            // read time over current upstream state.
            DatasetKind::View => return EvalOutcome::skipped(),
        };

        match result {
            Ok(outcome) => {
                if !matches!(outcome.status, DatasetStatus::Failed { .. }) {
                    self.runtime[idx].consecutive_failures.store(0, Ordering::SeqCst);
                }
                outcome
            }
            Err(err) if err.is_fatal() => EvalOutcome {
                status: DatasetStatus::Failed {
                    error: err.to_string(),
                },
                violations: Vec::new(),
                fatal: Some(err),
            },
            Err(err) => self.record_failure(idx, dataset, cycle_id, err),
        }
    }

    fn record_failure(
        &self,
        idx: usize,
        dataset: &Dataset,
        cycle_id: u64,
        err: CascadeError,
    ) -> EvalOutcome {
        let failures = self.runtime[idx]
            .consecutive_failures
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        warn!(
            dataset = dataset.name(),
            cycle = cycle_id,
            failures,
            error = %err,
            "dataset evaluation failed"
        );
        let fatal = if failures >= self.config.max_consecutive_failures {
            Some(CascadeError::FailureThresholdExceeded {
                dataset: dataset.name().to_string(),
                failures,
            })
        } else {
            None
        };
        EvalOutcome {
            status: DatasetStatus::Failed {
                error: err.to_string(),
            },
            violations: Vec::new(),
            fatal,
        }
    }

    fn evaluate_source(
        &self,
        idx: usize,
        dataset: &Dataset,
        location: &str,
        format: &str,
        options: &HashMap<String, String>,
        cycle_id: u64,
    ) -> Result<EvalOutcome> {
        let name = dataset.name();
        let from = self.checkpoints.get(name, location)?;
        let batches = self.source_reader.poll(location, format, options, from)?;
        let committed_once = self.runtime[idx].committed_once.load(Ordering::SeqCst);
        if batches.is_empty() && committed_once {
            debug!(dataset = name, cycle = cycle_id, "no new raw input, skipping");
            return Ok(EvalOutcome::skipped());
        }
        self.runtime[idx].invocations.fetch_add(1, Ordering::SeqCst);

        let mut violations = Vec::new();
        let mut txn = CommitTxn::new(name, self.tables.as_ref(), self.checkpoints.as_ref());
        let mut last_end = from;
        for batch in &batches {
            let (outcome, records) =
                constraints::evaluate(name, cycle_id, batch.data(), dataset.constraints())?;
            violations.extend(records);
            match outcome {
                EnforcementOutcome::Passed(surviving) => {
                    txn.stage_append(RowBatch::new(surviving, batch.offsets()));
                }
                EnforcementOutcome::Rejected {
                    constraint,
                    violations: violated,
                    total,
                } => {
                    return Ok(EvalOutcome {
                        status: DatasetStatus::Failed {
                            error: CascadeError::ConstraintFailed {
                                dataset: name.to_string(),
                                constraint: constraint.clone(),
                                violations: violated,
                                total,
                            }
                            .to_string(),
                        },
                        violations,
                        fatal: self.constraint_failure(idx, name, constraint, violated, total),
                    });
                }
            }
            last_end = Some(last_end.map_or(batch.offsets().end, |o| o.max(batch.offsets().end)));
        }
        if let Some(end) = last_end {
            txn.stage_advance(location, end);
        }
        let rows = txn.commit()?;
        self.runtime[idx].committed_once.store(true, Ordering::SeqCst);
        debug!(dataset = name, cycle = cycle_id, rows, "source batches committed");
        Ok(EvalOutcome {
            status: DatasetStatus::Committed { rows },
            violations,
            fatal: None,
        })
    }

    fn evaluate_derived(
        &self,
        idx: usize,
        dataset: &Dataset,
        cycle_id: u64,
    ) -> Result<EvalOutcome> {
        let name = dataset.name();
        // An intent left behind by an interrupted commit must be
        // completed before new input is folded in, otherwise the retry
        // would re-emit the already-applied rows under a wider range.
        if let Some(pending) = self.checkpoints.pending(name)? {
            self.complete_interrupted_commit(idx, dataset, &pending, cycle_id)?;
        }
        let committed_once = self.runtime[idx].committed_once.load(Ordering::SeqCst);

        // Gather inputs and detect whether anything is new.
        let mut ctx = TransformContext::new();
        let mut has_new = !committed_once;
        let mut frontier_prev = 0u64;
        let mut frontier_new = 0u64;
        let mut advances: Vec<(String, Offset)> = Vec::new();
        let mut seen_versions: Vec<(usize, u64)> = Vec::new();

        for edge in self.graph.reads_of(idx) {
            let producer = self.registry.get(edge.producer);
            match edge.mode {
                AccessMode::Stream => {
                    let cp = self.checkpoints.get(name, producer.name())?;
                    let batches = self.tables.read_since(producer.name(), cp)?;
                    let prev = cp.map_or(0, Offset::value);
                    let new_end = batches
                        .iter()
                        .map(|b| b.offsets().end.value())
                        .max()
                        .unwrap_or(prev);
                    frontier_prev += prev;
                    frontier_new += new_end;
                    if !batches.is_empty() {
                        has_new = true;
                        advances.push((producer.name().to_string(), Offset(new_end)));
                    }
                    ctx.insert_stream(producer.name(), batches);
                }
                AccessMode::Snapshot => {
                    let (content, version) = self.snapshot_of(edge.producer, cycle_id)?;
                    let last_seen = self.runtime[idx]
                        .snapshot_versions
                        .lock()
                        .get(&edge.producer)
                        .copied();
                    let changed = match version {
                        Some(v) => last_seen != Some(v),
                        // Views have no content version; treat as always
                        // changed.
                        None => true,
                    };
                    if changed {
                        has_new = true;
                    }
                    frontier_prev += last_seen.unwrap_or(0);
                    frontier_new += version.unwrap_or(0);
                    if let Some(v) = version {
                        seen_versions.push((edge.producer, v));
                    }
                    ctx.insert_snapshot(producer.name(), content);
                }
            }
        }

        if !has_new {
            debug!(dataset = name, cycle = cycle_id, "no new input, skipping");
            return Ok(EvalOutcome::skipped());
        }

        self.runtime[idx].invocations.fetch_add(1, Ordering::SeqCst);
        let output = self.apply_transform(dataset, &ctx)?;
        let candidate = concat(&dataset.schema(), &output)?;

        let (outcome, violations) =
            constraints::evaluate(name, cycle_id, &candidate, dataset.constraints())?;
        let surviving = match outcome {
            EnforcementOutcome::Passed(surviving) => surviving,
            EnforcementOutcome::Rejected {
                constraint,
                violations: violated,
                total,
            } => {
                // Nothing commits and no checkpoint advances: the next
                // cycle retries with the same plus any newer input.
                return Ok(EvalOutcome {
                    status: DatasetStatus::Failed {
                        error: CascadeError::ConstraintFailed {
                            dataset: name.to_string(),
                            constraint: constraint.clone(),
                            violations: violated,
                            total,
                        }
                        .to_string(),
                    },
                    violations,
                    fatal: self.constraint_failure(idx, name, constraint, violated, total),
                });
            }
        };

        // The output range is derived deterministically from consumed
        // input frontiers so that a replayed cycle stamps the identical
        // range and the append deduplicates. Snapshot-only refreshes get
        // a synthetic bump to keep ranges advancing.
        if frontier_new <= frontier_prev {
            frontier_new = frontier_prev + 1;
        }
        let range = OffsetRange::new(frontier_prev, frontier_new);
        let mut txn = CommitTxn::new(name, self.tables.as_ref(), self.checkpoints.as_ref());
        txn.stage_append(RowBatch::new(surviving, range));
        for (producer, offset) in advances {
            txn.stage_advance(producer, offset);
        }
        let rows = txn.commit()?;

        let mut versions = self.runtime[idx].snapshot_versions.lock();
        for (producer, version) in seen_versions {
            versions.insert(producer, version);
        }
        drop(versions);
        self.runtime[idx].committed_once.store(true, Ordering::SeqCst);
        debug!(dataset = name, cycle = cycle_id, rows, range = %range, "committed");
        Ok(EvalOutcome {
            status: DatasetStatus::Committed { rows },
            violations,
            fatal: None,
        })
    }

    /// Finish a commit whose append may have applied but whose
    /// checkpoint advances were lost. The staged intent records the
    /// exact per-producer input frontier, so the transform replays over
    /// the same stream input it originally saw and the append
    /// deduplicates under its original range. Upstream batches that
    /// arrived after the interrupted commit are excluded here; they
    /// commit separately once recovery is done.
    fn complete_interrupted_commit(
        &self,
        idx: usize,
        dataset: &Dataset,
        pending: &PendingCommit,
        cycle_id: u64,
    ) -> Result<()> {
        let name = dataset.name();
        warn!(
            dataset = name,
            cycle = cycle_id,
            range = %pending.range,
            "completing interrupted commit"
        );
        let frontiers: HashMap<&str, u64> = pending
            .advances
            .iter()
            .map(|(producer, offset)| (producer.as_str(), *offset))
            .collect();

        let mut ctx = TransformContext::new();
        for edge in self.graph.reads_of(idx) {
            let producer = self.registry.get(edge.producer);
            match edge.mode {
                AccessMode::Stream => {
                    let cp = self.checkpoints.get(name, producer.name())?;
                    let batches = match frontiers.get(producer.name()) {
                        Some(&frontier) => self
                            .tables
                            .read_since(producer.name(), cp)?
                            .into_iter()
                            .filter(|b| b.offsets().end.value() <= frontier)
                            .collect(),
                        // No advance was staged for this edge: the
                        // interrupted commit consumed nothing from it.
                        None => Vec::new(),
                    };
                    ctx.insert_stream(producer.name(), batches);
                }
                AccessMode::Snapshot => {
                    let (content, _) = self.snapshot_of(edge.producer, cycle_id)?;
                    ctx.insert_snapshot(producer.name(), content);
                }
            }
        }

        self.runtime[idx].invocations.fetch_add(1, Ordering::SeqCst);
        let output = self.apply_transform(dataset, &ctx)?;
        let candidate = concat(&dataset.schema(), &output)?;
        let (outcome, _) =
            constraints::evaluate(name, cycle_id, &candidate, dataset.constraints())?;
        let surviving = match outcome {
            EnforcementOutcome::Passed(surviving) => surviving,
            EnforcementOutcome::Rejected {
                constraint,
                violations,
                total,
            } => {
                return Err(CascadeError::ConstraintFailed {
                    dataset: name.to_string(),
                    constraint,
                    violations,
                    total,
                });
            }
        };

        let mut txn = CommitTxn::new(name, self.tables.as_ref(), self.checkpoints.as_ref());
        txn.stage_append(RowBatch::new(surviving, pending.range));
        for (producer, offset) in &pending.advances {
            txn.stage_advance(producer.clone(), Offset(*offset));
        }
        txn.commit()?;
        self.runtime[idx].committed_once.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn evaluate_full_refresh(
        &self,
        idx: usize,
        dataset: &Dataset,
        cycle_id: u64,
    ) -> Result<EvalOutcome> {
        let name = dataset.name();
        // A full-refresh table never checkpoints partial input: every
        // cycle recomputes wholesale from current upstream snapshots.
        let mut ctx = TransformContext::new();
        for edge in self.graph.reads_of(idx) {
            let (content, _) = self.snapshot_of(edge.producer, cycle_id)?;
            ctx.insert_snapshot(self.registry.get(edge.producer).name(), content);
        }
        self.runtime[idx].invocations.fetch_add(1, Ordering::SeqCst);
        let output = self.apply_transform(dataset, &ctx)?;
        let candidate = concat(&dataset.schema(), &output)?;

        let (outcome, violations) =
            constraints::evaluate(name, cycle_id, &candidate, dataset.constraints())?;
        match outcome {
            EnforcementOutcome::Passed(surviving) => {
                let rows = surviving.num_rows();
                self.tables.replace(name, vec![surviving])?;
                self.runtime[idx].committed_once.store(true, Ordering::SeqCst);
                debug!(dataset = name, cycle = cycle_id, rows, "full refresh replaced");
                Ok(EvalOutcome {
                    status: DatasetStatus::Committed { rows },
                    violations,
                    fatal: None,
                })
            }
            EnforcementOutcome::Rejected {
                constraint,
                violations: violated,
                total,
            } => Ok(EvalOutcome {
                status: DatasetStatus::Failed {
                    error: CascadeError::ConstraintFailed {
                        dataset: name.to_string(),
                        constraint: constraint.clone(),
                        violations: violated,
                        total,
                    }
                    .to_string(),
                },
                violations,
                fatal: self.constraint_failure(idx, name, constraint, violated, total),
            }),
        }
    }

    /// Current content of a producer for snapshot-mode access, plus its
    /// content version (`None` for views, which are evaluated inline).
    fn snapshot_of(&self, producer: usize, cycle_id: u64) -> Result<(Vec<RecordBatch>, Option<u64>)> {
        let dataset = self.registry.get(producer);
        if matches!(dataset.kind(), DatasetKind::View) {
            return Ok((self.evaluate_view(producer, cycle_id)?, None));
        }
        let content = self.tables.read_snapshot(dataset.name())?;
        let version = self.tables.version(dataset.name())?;
        Ok((content, Some(version)))
    }

    /// Evaluate a view on demand over current upstream state. Views never
    /// persist; their constraints are enforced per read.
    pub(crate) fn evaluate_view(&self, idx: usize, cycle_id: u64) -> Result<Vec<RecordBatch>> {
        let dataset = self.registry.get(idx);
        let mut ctx = TransformContext::new();
        for edge in self.graph.reads_of(idx) {
            let (content, _) = self.snapshot_of(edge.producer, cycle_id)?;
            ctx.insert_snapshot(self.registry.get(edge.producer).name(), content);
        }
        self.runtime[idx].invocations.fetch_add(1, Ordering::SeqCst);
        let output = self.apply_transform(dataset, &ctx)?;
        let candidate = concat(&dataset.schema(), &output)?;
        let (outcome, violations) =
            constraints::evaluate(dataset.name(), cycle_id, &candidate, dataset.constraints())?;
        for record in violations {
            for sink in &self.sinks {
                sink.record_violation(&record);
            }
            self.constraint_metrics.record(record);
        }
        match outcome {
            EnforcementOutcome::Passed(surviving) => Ok(vec![surviving]),
            EnforcementOutcome::Rejected {
                constraint,
                violations: violated,
                total,
            } => Err(CascadeError::ConstraintFailed {
                dataset: dataset.name().to_string(),
                constraint,
                violations: violated,
                total,
            }),
        }
    }

    pub(crate) fn current_cycle(&self) -> u64 {
        self.cycle_counter.load(Ordering::SeqCst)
    }

    fn apply_transform(&self, dataset: &Dataset, ctx: &TransformContext) -> Result<Vec<RecordBatch>> {
        let transform = dataset.transform.as_ref().ok_or_else(|| {
            CascadeError::internal(format!(
                "dataset '{}' has no transform; the graph builder should have rejected it",
                dataset.name()
            ))
        })?;
        transform(ctx).map_err(|err| match err {
            err @ CascadeError::TransformExecution { .. } => err,
            other => CascadeError::transform(dataset.name(), other.to_string()),
        })
    }

    /// Track a constraint rejection against the failure threshold.
    fn constraint_failure(
        &self,
        idx: usize,
        dataset: &str,
        constraint: String,
        violated: usize,
        total: usize,
    ) -> Option<CascadeError> {
        let failures = self.runtime[idx]
            .consecutive_failures
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        warn!(
            dataset,
            constraint = %constraint,
            violated,
            total,
            failures,
            "fail-update constraint rejected batch"
        );
        if failures >= self.config.max_consecutive_failures {
            Some(CascadeError::FailureThresholdExceeded {
                dataset: dataset.to_string(),
                failures,
            })
        } else {
            None
        }
    }
}
