//! Dataset dependency graph.
//!
//! Every dataset is produced by one registered generator. Generators are
//! either whole-batch (one call returns every row) or per-sample (one call
//! per sample index, run in parallel by the executor).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use sg_compute::ExternalComputeSession;
use sg_data::ParameterCatalog;
use sg_types::{DatasetError, GeneratorConfig, SgResult, Table};

/// Whole-batch generator: returns `num_samples` row-major rows.
pub type BatchFn = Arc<dyn Fn(&BatchContext<'_>) -> SgResult<Vec<f64>> + Send + Sync>;

/// Per-sample generator: returns one output row.
pub type SampleFn = Arc<dyn Fn(&mut SampleContext<'_>) -> SgResult<Vec<f64>> + Send + Sync>;

#[derive(Clone)]
pub enum GeneratorKind {
    WholeBatch(BatchFn),
    PerSample(SampleFn),
}

impl fmt::Debug for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WholeBatch(_) => write!(f, "WholeBatch"),
            Self::PerSample(_) => write!(f, "PerSample"),
        }
    }
}

/// Registration record for one dataset generator.
#[derive(Debug, Clone)]
pub struct GeneratorDescriptor {
    pub name: String,
    /// Catalog domain whose parameters define the output columns.
    pub columns_domain: String,
    pub kind: GeneratorKind,
    pub needs_external_compute: bool,
    pub depends_on: BTreeSet<String>,
}

impl GeneratorDescriptor {
    pub fn whole_batch<F>(name: &str, columns_domain: &str, generator: F) -> Self
    where
        F: Fn(&BatchContext<'_>) -> SgResult<Vec<f64>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            columns_domain: columns_domain.to_string(),
            kind: GeneratorKind::WholeBatch(Arc::new(generator)),
            needs_external_compute: false,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn per_sample<F>(name: &str, columns_domain: &str, generator: F) -> Self
    where
        F: Fn(&mut SampleContext<'_>) -> SgResult<Vec<f64>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            columns_domain: columns_domain.to_string(),
            kind: GeneratorKind::PerSample(Arc::new(generator)),
            needs_external_compute: false,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_external_compute(mut self) -> Self {
        self.needs_external_compute = true;
        self
    }

    pub fn depends_on(mut self, datasets: &[&str]) -> Self {
        self.depends_on.extend(datasets.iter().map(|d| d.to_string()));
        self
    }

    pub fn is_whole_batch(&self) -> bool {
        matches!(self.kind, GeneratorKind::WholeBatch(_))
    }
}

/// A registered dataset with its resolved output columns.
#[derive(Debug, Clone)]
pub struct DatasetEntry {
    pub descriptor: GeneratorDescriptor,
    pub columns: Vec<String>,
}

impl DatasetEntry {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }
}

/// All registered datasets, in registration order.
#[derive(Debug, Clone, Default)]
pub struct DatasetGraph {
    entries: Vec<DatasetEntry>,
}

impl DatasetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator; its output columns are the catalog parameters
    /// of `descriptor.columns_domain`.
    pub fn register_generator(
        &mut self,
        descriptor: GeneratorDescriptor,
        catalog: &ParameterCatalog,
    ) -> SgResult<()> {
        if self.get(&descriptor.name).is_some() {
            return Err(DatasetError::DuplicateDataset { name: descriptor.name }.into());
        }

        let columns = catalog.domain_columns(&descriptor.columns_domain)?;
        tracing::debug!(
            "Registered dataset {} ({:?}, {} columns, depends on {:?})",
            descriptor.name,
            descriptor.kind,
            columns.len(),
            descriptor.depends_on
        );
        self.entries.push(DatasetEntry { descriptor, columns });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&DatasetEntry> {
        self.entries.iter().find(|s| s.name() == name)
    }

    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(DatasetEntry::name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn needs_external_compute(&self) -> bool {
        self.entries.iter().any(|s| s.descriptor.needs_external_compute)
    }

    /// True iff every dependency of `entry` has been completed.
    pub fn is_ready(entry: &DatasetEntry, completed: &BTreeSet<String>) -> bool {
        entry.descriptor.depends_on.iter().all(|d| completed.contains(d))
    }

    /// Every dependency must name a registered dataset.
    pub fn validate(&self) -> SgResult<()> {
        for entry in &self.entries {
            for dependency in &entry.descriptor.depends_on {
                if self.get(dependency).is_none() {
                    return Err(DatasetError::MissingDependency {
                        dataset: entry.name().to_string(),
                        dependency: dependency.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Order in which datasets can be generated.
    ///
    /// Repeatedly scans the pending datasets and takes every one whose
    /// dependencies are complete; a pass without progress means a cycle.
    pub fn generation_order(&self) -> SgResult<Vec<String>> {
        self.validate()?;

        let mut completed: BTreeSet<String> = BTreeSet::new();
        let mut order = Vec::with_capacity(self.entries.len());
        while order.len() < self.entries.len() {
            let mut progressed = false;
            for entry in &self.entries {
                if completed.contains(entry.name()) || !Self::is_ready(entry, &completed) {
                    continue;
                }
                completed.insert(entry.name().to_string());
                order.push(entry.name().to_string());
                progressed = true;
            }

            if !progressed {
                let pending = self
                    .entries
                    .iter()
                    .map(DatasetEntry::name)
                    .filter(|n| !completed.contains(*n))
                    .map(str::to_string)
                    .collect();
                return Err(DatasetError::CyclicDependency { pending }.into());
            }
        }
        Ok(order)
    }
}

/// Read access to the datasets a generator declared as dependencies.
#[derive(Debug, Clone, Default)]
pub struct DatasetInputs<'a> {
    tables: BTreeMap<&'a str, &'a Table>,
}

impl<'a> DatasetInputs<'a> {
    /// Collect the declared dependencies of `entry` from `completed`.
    pub fn for_entry(entry: &DatasetEntry, completed: &'a BTreeMap<String, Table>) -> SgResult<Self> {
        let mut tables = BTreeMap::new();
        for dependency in &entry.descriptor.depends_on {
            let (name, table) = completed.get_key_value(dependency).ok_or_else(|| {
                DatasetError::MissingDependency {
                    dataset: entry.name().to_string(),
                    dependency: dependency.clone(),
                }
            })?;
            tables.insert(name.as_str(), table);
        }
        Ok(Self { tables })
    }

    pub fn get(&self, name: &str) -> SgResult<&'a Table> {
        self.tables
            .get(name)
            .copied()
            .ok_or_else(|| DatasetError::UnknownDataset { name: name.to_string() }.into())
    }

    /// One row of a dependency dataset.
    pub fn row(&self, name: &str, index: usize) -> SgResult<&'a [f64]> {
        let table = self.get(name)?;
        table.row(index).ok_or_else(|| {
            DatasetError::RowCountMismatch {
                dataset: name.to_string(),
                expected: index + 1,
                actual: table.num_rows(),
            }
            .into()
        })
    }

    /// `name=value` pairs of every dependency at `index`, for diagnostics.
    pub fn describe_row(&self, index: usize) -> String {
        self.tables
            .iter()
            .filter_map(|(dataset, table)| {
                let row = table.row(index)?;
                let values = table
                    .columns()
                    .iter()
                    .zip(row)
                    .map(|(c, v)| format!("{c}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                Some(format!("{dataset}: {{{values}}}"))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Everything a whole-batch generator may read.
pub struct BatchContext<'a> {
    pub dataset: &'a str,
    pub num_samples: usize,
    pub catalog: &'a ParameterCatalog,
    pub config: &'a GeneratorConfig,
    pub inputs: &'a DatasetInputs<'a>,
}

/// Everything a per-sample generator may read, plus the worker's simulator.
pub struct SampleContext<'a> {
    pub dataset: &'a str,
    pub worker_id: usize,
    /// Global sample index.
    pub sample_index: usize,
    /// Index within the worker's partition.
    pub local_index: usize,
    pub catalog: &'a ParameterCatalog,
    pub config: &'a GeneratorConfig,
    pub inputs: &'a DatasetInputs<'a>,
    pub(crate) session: Option<&'a mut ExternalComputeSession>,
}

impl<'a> SampleContext<'a> {
    /// The worker's simulator session.
    pub fn session(&mut self) -> SgResult<&mut ExternalComputeSession> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(DatasetError::NoSession { dataset: self.dataset.to_string() }.into()),
        }
    }

    /// This sample's row of a dependency dataset.
    pub fn input_row(&self, dataset: &str) -> SgResult<&'a [f64]> {
        self.inputs.row(dataset, self.sample_index)
    }

    /// One named value from this sample's row of a dependency dataset.
    pub fn input_value(&self, dataset: &str, column: &str) -> SgResult<f64> {
        let table = self.inputs.get(dataset)?;
        table.value(self.sample_index, column).ok_or_else(|| {
            sg_types::CatalogError::UnknownColumn { column: format!("{dataset}.{column}") }.into()
        })
    }
}
