//! Dataset declarations.
//!
//! A dataset is a named node in the pipeline DAG: a source-fed incremental
//! table, a derived incremental table, a full-refresh table, or a view.
//! Declarations carry the transform (which upstream datasets it reads and
//! how), the row-level quality constraints, and free-form metadata.
//!
//! Kinds and violation policies are tagged variants dispatched by pattern
//! match so that evaluation logic stays exhaustive and statically checked.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::batch::RowBatch;
use crate::error::{CascadeError, Result};

/// How a consumer reads an upstream dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read only rows appended since the consumer's last checkpoint
    /// against this producer.
    Stream,
    /// Read the full current state of the producer on every evaluation.
    Snapshot,
}

/// An upstream read declared by a transform, in declaration order.
#[derive(Debug, Clone)]
pub struct ReadRef {
    pub dataset: String,
    pub mode: AccessMode,
}

/// What happens to rows that violate a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationPolicy {
    /// Any violating row aborts the whole batch commit for the dataset.
    FailUpdate,
    /// Violating rows are removed from the surviving set.
    DropRow,
    /// Violating rows are retained but counted and reported.
    Observe,
}

/// Row-level predicate evaluated against a candidate output batch.
/// Returns one boolean per row; `true` means the row passes. A null
/// result slot counts as a violation.
pub type PredicateFn = Arc<dyn Fn(&RecordBatch) -> Result<BooleanArray> + Send + Sync>;

/// A declared quality constraint.
#[derive(Clone)]
pub struct Constraint {
    pub name: String,
    pub policy: ViolationPolicy,
    pub predicate: PredicateFn,
}

impl Constraint {
    pub fn new<F>(name: impl Into<String>, policy: ViolationPolicy, predicate: F) -> Self
    where
        F: Fn(&RecordBatch) -> Result<BooleanArray> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            policy,
            predicate: Arc::new(predicate),
        }
    }
}

impl std::fmt::Debug for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Constraint")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Inputs handed to a transform for one evaluation.
///
/// Stream-mode reads expose only the batches that arrived since the
/// dataset's last checkpoint; snapshot-mode reads expose the producer's
/// full current content.
#[derive(Default)]
pub struct TransformContext {
    streams: HashMap<String, Vec<RowBatch>>,
    snapshots: HashMap<String, Vec<RecordBatch>>,
}

impl TransformContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_stream(&mut self, dataset: impl Into<String>, batches: Vec<RowBatch>) {
        self.streams.insert(dataset.into(), batches);
    }

    pub(crate) fn insert_snapshot(
        &mut self,
        dataset: impl Into<String>,
        batches: Vec<RecordBatch>,
    ) {
        self.snapshots.insert(dataset.into(), batches);
    }

    /// New batches from a stream-mode upstream.
    pub fn stream(&self, dataset: &str) -> Result<&[RowBatch]> {
        self.streams
            .get(dataset)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                CascadeError::invalid_argument(format!(
                    "no stream-mode read of '{dataset}' was declared"
                ))
            })
    }

    /// Full current content of a snapshot-mode upstream.
    pub fn snapshot(&self, dataset: &str) -> Result<&[RecordBatch]> {
        self.snapshots
            .get(dataset)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                CascadeError::invalid_argument(format!(
                    "no snapshot-mode read of '{dataset}' was declared"
                ))
            })
    }
}

/// Pure function from input batches to output batches. Treated as
/// deterministic: replaying the same inputs must produce the same output.
pub type TransformFn = Arc<dyn Fn(&TransformContext) -> Result<Vec<RecordBatch>> + Send + Sync>;

/// The kind of a dataset, determining its evaluation and persistence
/// semantics.
#[derive(Clone)]
pub enum DatasetKind {
    /// Fed by an external source reader; rows are appended incrementally
    /// with the reader's arrival offsets.
    SourceIncremental {
        location: String,
        format: String,
        options: HashMap<String, String>,
    },
    /// Computed from upstream datasets; only new upstream input is
    /// processed each cycle and output is appended.
    DerivedIncremental,
    /// Recomputed wholesale from upstream snapshots each cycle; stored
    /// rows are replaced, never appended.
    FullRefresh,
    /// No persisted storage; re-evaluated over current upstream state at
    /// read time.
    View,
}

impl std::fmt::Debug for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceIncremental {
                location, format, ..
            } => write!(f, "SourceIncremental({location}, {format})"),
            Self::DerivedIncremental => write!(f, "DerivedIncremental"),
            Self::FullRefresh => write!(f, "FullRefresh"),
            Self::View => write!(f, "View"),
        }
    }
}

/// A dataset declaration: name, kind, schema, transform, constraints,
/// and metadata. Built fluently and handed to the registry.
#[derive(Clone)]
pub struct Dataset {
    pub(crate) name: String,
    pub(crate) kind: DatasetKind,
    pub(crate) schema: SchemaRef,
    pub(crate) reads: Vec<ReadRef>,
    pub(crate) transform: Option<TransformFn>,
    pub(crate) constraints: Vec<Constraint>,
    pub(crate) comment: Option<String>,
    pub(crate) properties: HashMap<String, String>,
}

impl Dataset {
    /// Declare a source-fed incremental table.
    pub fn source(
        name: impl Into<String>,
        schema: SchemaRef,
        location: impl Into<String>,
        format: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            schema,
            DatasetKind::SourceIncremental {
                location: location.into(),
                format: format.into(),
                options: HashMap::new(),
            },
        )
    }

    /// Declare a derived incremental table.
    pub fn derived(name: impl Into<String>, schema: SchemaRef) -> Self {
        Self::new(name, schema, DatasetKind::DerivedIncremental)
    }

    /// Declare a full-refresh table.
    pub fn full_refresh(name: impl Into<String>, schema: SchemaRef) -> Self {
        Self::new(name, schema, DatasetKind::FullRefresh)
    }

    /// Declare a view.
    pub fn view(name: impl Into<String>, schema: SchemaRef) -> Self {
        Self::new(name, schema, DatasetKind::View)
    }

    fn new(name: impl Into<String>, schema: SchemaRef, kind: DatasetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            schema,
            reads: Vec::new(),
            transform: None,
            constraints: Vec::new(),
            comment: None,
            properties: HashMap::new(),
        }
    }

    /// Declare a stream-mode read of an upstream dataset.
    pub fn with_stream_read(mut self, dataset: impl Into<String>) -> Self {
        self.reads.push(ReadRef {
            dataset: dataset.into(),
            mode: AccessMode::Stream,
        });
        self
    }

    /// Declare a snapshot-mode read of an upstream dataset.
    pub fn with_snapshot_read(mut self, dataset: impl Into<String>) -> Self {
        self.reads.push(ReadRef {
            dataset: dataset.into(),
            mode: AccessMode::Snapshot,
        });
        self
    }

    /// Set the transform function.
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&TransformContext) -> Result<Vec<RecordBatch>> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Attach a quality constraint. Constraints evaluate in declaration
    /// order.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Set a reader option (source datasets only; ignored otherwise).
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let DatasetKind::SourceIncremental { options, .. } = &mut self.kind {
            options.insert(key.into(), value.into());
        }
        self
    }

    /// Set a descriptive comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set a free-form property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &DatasetKind {
        &self.kind
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn reads(&self) -> &[ReadRef] {
        &self.reads
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Whether this dataset persists rows across cycles.
    pub fn is_table(&self) -> bool {
        !matches!(self.kind, DatasetKind::View)
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("reads", &self.reads)
            .field("constraints", &self.constraints)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]))
    }

    #[test]
    fn test_builder_accumulates_reads_in_order() {
        let ds = Dataset::derived("silver", test_schema())
            .with_stream_read("bronze_a")
            .with_snapshot_read("dims");
        assert_eq!(ds.reads().len(), 2);
        assert_eq!(ds.reads()[0].dataset, "bronze_a");
        assert_eq!(ds.reads()[0].mode, AccessMode::Stream);
        assert_eq!(ds.reads()[1].mode, AccessMode::Snapshot);
    }

    #[test]
    fn test_source_options() {
        let ds = Dataset::source("raw", test_schema(), "/data/raw", "json")
            .with_option("multiline", "true");
        match ds.kind() {
            DatasetKind::SourceIncremental { options, .. } => {
                assert_eq!(options.get("multiline").map(String::as_str), Some("true"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_view_is_not_a_table() {
        assert!(!Dataset::view("v", test_schema()).is_table());
        assert!(Dataset::full_refresh("t", test_schema()).is_table());
    }

    #[test]
    fn test_transform_context_rejects_undeclared_reads() {
        let ctx = TransformContext::new();
        assert!(ctx.stream("missing").is_err());
        assert!(ctx.snapshot("missing").is_err());
    }
}
