//! Dataset registry with an explicit freeze lifecycle.
//!
//! Declarations are collected into a [`DatasetRegistry`], then frozen into
//! an immutable [`FrozenRegistry`] that the graph builder and engine
//! consume. Registration after freezing fails; the catalog is explicit
//! process-scoped state, never an ambient singleton.

use std::collections::HashMap;

use crate::dataset::{Dataset, DatasetKind};
use crate::error::{CascadeError, Result};

/// Mutable catalog of dataset declarations.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    datasets: Vec<Dataset>,
    by_name: HashMap<String, usize>,
    frozen: bool,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset declaration. Declaration order is preserved and
    /// later used as the deterministic topological tie-break.
    pub fn register(&mut self, dataset: Dataset) -> Result<()> {
        if self.frozen {
            return Err(CascadeError::frozen_registry(dataset.name()));
        }
        if self.by_name.contains_key(dataset.name()) {
            return Err(CascadeError::duplicate_name(dataset.name()));
        }
        self.by_name
            .insert(dataset.name().to_string(), self.datasets.len());
        self.datasets.push(dataset);
        Ok(())
    }

    /// Look up a dataset by name.
    pub fn resolve(&self, name: &str) -> Result<&Dataset> {
        self.by_name
            .get(name)
            .map(|&idx| &self.datasets[idx])
            .ok_or_else(|| CascadeError::unknown_dataset(name))
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Freeze the registry, resolving `${param}` substitutions in source
    /// locations and reader options. After this, `register` fails and the
    /// returned catalog is immutable for the rest of the run.
    pub fn freeze(mut self, params: &HashMap<String, String>) -> Result<FrozenRegistry> {
        self.frozen = true;
        for dataset in &mut self.datasets {
            let name = dataset.name.clone();
            if let DatasetKind::SourceIncremental {
                location, options, ..
            } = &mut dataset.kind
            {
                *location = substitute(&name, location, params)?;
                for value in options.values_mut() {
                    *value = substitute(&name, value, params)?;
                }
            }
        }
        Ok(FrozenRegistry {
            datasets: self.datasets,
            by_name: self.by_name,
        })
    }
}

/// Immutable catalog produced by [`DatasetRegistry::freeze`]. Safe to
/// share by reference across evaluation threads.
#[derive(Debug)]
pub struct FrozenRegistry {
    datasets: Vec<Dataset>,
    by_name: HashMap<String, usize>,
}

impl FrozenRegistry {
    pub fn resolve(&self, name: &str) -> Result<&Dataset> {
        self.index_of(name).map(|idx| &self.datasets[idx])
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| CascadeError::unknown_dataset(name))
    }

    pub fn get(&self, index: usize) -> &Dataset {
        &self.datasets[index]
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Datasets in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter()
    }
}

/// Resolve `${key}` placeholders against the parameter map. Performed
/// once at build time, never per cycle. Unresolved placeholders are a
/// build error naming the dataset.
fn substitute(dataset: &str, input: &str, params: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            CascadeError::invalid_argument(format!(
                "unterminated parameter reference in '{input}' for dataset '{dataset}'"
            ))
        })?;
        let key = &after[..end];
        let value = params.get(key).ok_or_else(|| {
            CascadeError::invalid_argument(format!(
                "unresolved parameter '{key}' for dataset '{dataset}'"
            ))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
