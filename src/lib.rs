//! Cascade - Embeddable Incremental Dataset Pipeline Engine
//!
//! Cascade runs declarative, layered data pipelines: datasets are declared
//! with transforms over upstream datasets and row-level quality
//! constraints, and the engine re-evaluates only datasets with new
//! upstream input on each cycle.
//!
//! # Features
//!
//! - **Dependency tracking**: declared reads build a validated DAG with a
//!   deterministic topological schedule
//! - **Incremental execution**: stream-mode reads process only rows past
//!   the consumer's checkpoint; unchanged datasets are skipped
//! - **Quality constraints**: per-row predicates with fail-update,
//!   drop-row, or observe-only violation policies and violation metrics
//! - **Streaming joins**: bounded keyed state over two incremental
//!   inputs with watermark eviction and exactly-once pair emission
//! - **Crash-safe commits**: appends are idempotent by offset range and
//!   checkpoints advance atomically with the data they describe
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arrow::datatypes::{DataType, Field, Schema};
//! use cascade::{Dataset, MemorySource, Pipeline, Result};
//!
//! fn main() -> Result<()> {
//!     let schema = Arc::new(Schema::new(vec![
//!         Field::new("order_number", DataType::Int64, true),
//!         Field::new("customer_id", DataType::Utf8, false),
//!     ]));
//!
//!     let source = Arc::new(MemorySource::new());
//!     let pipeline = Pipeline::builder()
//!         .with_param("data_root", "/mnt/landing")
//!         .with_source_reader(source.clone())
//!         .register(Dataset::source(
//!             "sales_orders_raw",
//!             schema.clone(),
//!             "${data_root}/orders",
//!             "json",
//!         ))?
//!         .build()?;
//!
//!     let report = pipeline.run_cycle()?;
//!     println!("committed {} rows", report.committed_rows("sales_orders_raw"));
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod constraints;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod graph;
pub mod join;
pub mod metrics;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use batch::{Offset, OffsetRange, RowBatch};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PendingCommit};
pub use constraints::{ConstraintMetrics, ViolationRecord};
pub use dataset::{
    AccessMode, Constraint, Dataset, DatasetKind, TransformContext, ViolationPolicy,
};
pub use engine::CancellationToken;
pub use error::{CascadeError, Result};
pub use graph::DependencyGraph;
pub use join::{JoinType, RetentionPolicy, StreamingJoin};
pub use metrics::{CycleReport, DatasetStatus, MetricsSink, TracingMetricsSink};
pub use registry::{DatasetRegistry, FrozenRegistry};
pub use store::{MemorySource, MemoryTableStore, SourceReader, TableStore};

use std::collections::HashMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;

use engine::{EngineConfig, IncrementalEngine};

/// Pipeline-level configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Consecutive failures of one dataset tolerated before the run
    /// aborts with a fatal error.
    pub max_consecutive_failures: usize,
    /// Evaluate independent datasets of a DAG layer on parallel worker
    /// threads.
    pub parallel_layers: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            parallel_layers: true,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_consecutive_failures(mut self, limit: usize) -> Self {
        self.max_consecutive_failures = limit;
        self
    }

    pub fn with_parallel_layers(mut self, parallel: bool) -> Self {
        self.parallel_layers = parallel;
        self
    }
}

/// Collects dataset declarations and collaborators, then freezes and
/// validates everything into a runnable [`Pipeline`].
pub struct PipelineBuilder {
    registry: DatasetRegistry,
    params: HashMap<String, String>,
    config: PipelineConfig,
    tables: Option<Arc<dyn TableStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    source_reader: Option<Arc<dyn SourceReader>>,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            registry: DatasetRegistry::new(),
            params: HashMap::new(),
            config: PipelineConfig::default(),
            tables: None,
            checkpoints: None,
            source_reader: None,
            sinks: Vec::new(),
        }
    }

    /// Register a dataset declaration.
    pub fn register(mut self, dataset: Dataset) -> Result<Self> {
        self.registry.register(dataset)?;
        Ok(self)
    }

    /// Define a substitution parameter, resolved once at build time.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom table store (defaults to [`MemoryTableStore`]).
    pub fn with_table_store(mut self, tables: Arc<dyn TableStore>) -> Self {
        self.tables = Some(tables);
        self
    }

    /// Use a custom checkpoint store (defaults to
    /// [`MemoryCheckpointStore`]).
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Use a source reader for source-fed datasets.
    pub fn with_source_reader(mut self, reader: Arc<dyn SourceReader>) -> Self {
        self.source_reader = Some(reader);
        self
    }

    /// Add a metrics sink; sinks fan out.
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Freeze the registry, build and validate the dependency graph, and
    /// assemble the engine. All declaration errors surface here, before
    /// any cycle runs.
    pub fn build(self) -> Result<Pipeline> {
        let registry = Arc::new(self.registry.freeze(&self.params)?);
        let graph = Arc::new(DependencyGraph::build(&registry)?);

        let tables = self
            .tables
            .unwrap_or_else(|| Arc::new(MemoryTableStore::new()));
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));
        let source_reader = self
            .source_reader
            .unwrap_or_else(|| Arc::new(MemorySource::new()));
        let sinks = if self.sinks.is_empty() {
            vec![Arc::new(TracingMetricsSink) as Arc<dyn MetricsSink>]
        } else {
            self.sinks
        };

        for dataset in registry.iter().filter(|d| d.is_table()) {
            tables.register(dataset.name(), dataset.schema())?;
        }

        let constraint_metrics = Arc::new(ConstraintMetrics::new());
        let cancellation = Arc::new(CancellationToken::new());
        let engine = IncrementalEngine::new(
            Arc::clone(&registry),
            Arc::clone(&graph),
            Arc::clone(&tables),
            checkpoints,
            source_reader,
            sinks,
            Arc::clone(&constraint_metrics),
            Arc::clone(&cancellation),
            EngineConfig {
                max_consecutive_failures: self.config.max_consecutive_failures,
                parallel_layers: self.config.parallel_layers,
            },
        );

        Ok(Pipeline {
            registry,
            engine,
            tables,
            constraint_metrics,
            cancellation,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A built, runnable pipeline.
///
/// The main entry point for driving evaluation cycles and reading
/// dataset contents. Tables read back their persisted snapshot; views
/// are evaluated on demand over current upstream state.
pub struct Pipeline {
    registry: Arc<FrozenRegistry>,
    engine: IncrementalEngine,
    tables: Arc<dyn TableStore>,
    constraint_metrics: Arc<ConstraintMetrics>,
    cancellation: Arc<CancellationToken>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("datasets", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Run one evaluation cycle over the DAG.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        self.engine.run_cycle()
    }

    /// Run `count` consecutive cycles, stopping early on a fatal error.
    pub fn run_cycles(&self, count: usize) -> Result<Vec<CycleReport>> {
        let mut reports = Vec::with_capacity(count);
        for _ in 0..count {
            reports.push(self.run_cycle()?);
        }
        Ok(reports)
    }

    /// Read a dataset's current content. Tables return their persisted
    /// snapshot; views are recomputed against current dependency state.
    pub fn read(&self, dataset: &str) -> Result<Vec<RecordBatch>> {
        let idx = self.registry.index_of(dataset)?;
        if matches!(self.registry.get(idx).kind(), DatasetKind::View) {
            self.engine.evaluate_view(idx, self.engine.current_cycle())
        } else {
            self.tables.read_snapshot(dataset)
        }
    }

    /// Constraint violation metrics, read-only.
    pub fn constraint_metrics(&self) -> Arc<ConstraintMetrics> {
        Arc::clone(&self.constraint_metrics)
    }

    /// Token for cooperative cancellation between DAG layers.
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancellation)
    }

    /// How many times a dataset's transform has been invoked; exposes
    /// the skip optimization to callers and tests.
    pub fn transform_invocations(&self, dataset: &str) -> Result<u64> {
        self.engine.transform_invocations(dataset)
    }

    /// The frozen dataset catalog.
    pub fn registry(&self) -> &FrozenRegistry {
        &self.registry
    }
}
