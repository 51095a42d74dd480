//! Training data driver: cache lookup, dependency-ordered generation,
//! persistence and joint filtering.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sg_compute::SimulatorLauncher;
use sg_data::{CacheKey, DatasetStore, ParameterCatalog, Role};
use sg_types::{DatasetError, HarnessConfig, SgError, SgResult, Table};

use crate::executor::{CancelFlag, CheckpointFn, ExecutorConfig, ParallelSampleGenerator, SampleJob};
use crate::graph::{BatchContext, DatasetGraph, DatasetInputs, DatasetEntry, GeneratorDescriptor, GeneratorKind};
use crate::notify::Notifier;
use crate::progress::{format_bytes, group_digits};

/// Generated (or loaded) datasets, jointly filtered and row-aligned.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub tables: BTreeMap<String, Table>,
    /// Rows dropped because some dataset had a non-finite value there.
    pub removed_rows: usize,
    /// Failed samples during generation; 0 for cached data.
    pub error_count: usize,
    pub key: CacheKey,
    pub from_cache: bool,
}

impl TrainingData {
    pub fn table(&self, name: &str) -> SgResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DatasetError::UnknownDataset { name: name.to_string() }.into())
    }

    pub fn num_rows(&self) -> usize {
        self.tables.values().next().map_or(0, Table::num_rows)
    }

    /// Columns tagged `(network, role)` across `datasets`, in catalog order.
    pub fn extract(
        &self,
        catalog: &ParameterCatalog,
        datasets: &[&str],
        network: &str,
        role: Role,
    ) -> SgResult<Table> {
        let sources = datasets
            .iter()
            .map(|name| self.table(name))
            .collect::<SgResult<Vec<_>>>()?;
        catalog.extract_columns(&sources, network, role)
    }
}

/// Expected in-memory footprint of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSizeEstimate {
    pub num_samples: usize,
    /// `(dataset, columns, bytes)` in registration order.
    pub datasets: Vec<(String, usize, u64)>,
}

impl DataSizeEstimate {
    pub fn total_bytes(&self) -> u64 {
        self.datasets.iter().map(|(_, _, bytes)| bytes).sum()
    }
}

/// Owns the dataset graph and produces [`TrainingData`] for one experiment.
pub struct DataGenerator {
    config: HarnessConfig,
    catalog: Arc<ParameterCatalog>,
    graph: DatasetGraph,
    store: DatasetStore,
    executor_config: ExecutorConfig,
    launcher: Option<Arc<dyn SimulatorLauncher>>,
    notifier: Mutex<Notifier>,
    cancel: CancelFlag,
    checkpoint: Option<CheckpointFn>,
    cache: RwLock<Option<Arc<TrainingData>>>,
}

impl std::fmt::Debug for DataGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataGenerator")
            .field("experiment", &self.config.experiment)
            .field("datasets", &self.graph.names())
            .field("store", &self.store)
            .finish()
    }
}

impl DataGenerator {
    pub fn new(config: HarnessConfig, catalog: Arc<ParameterCatalog>) -> SgResult<Self> {
        config.validate()?;
        if !catalog.is_built() {
            return Err(sg_types::CatalogError::NotBuilt.into());
        }

        let store = DatasetStore::new(
            &config.generator.data_root,
            &config.experiment,
            &config.generator.file_template,
        );
        let executor_config = ExecutorConfig::from_generator_config(&config.generator);
        Ok(Self {
            config,
            catalog,
            graph: DatasetGraph::new(),
            store,
            executor_config,
            launcher: None,
            notifier: Mutex::new(Notifier::disabled()),
            cancel: CancelFlag::new(),
            checkpoint: None,
            cache: RwLock::new(None),
        })
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn SimulatorLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_notifier(self, notifier: Notifier) -> Self {
        *self.notifier.lock() = notifier;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointFn) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_executor_config(mut self, executor_config: ExecutorConfig) -> Self {
        self.executor_config = executor_config;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<ParameterCatalog> {
        &self.catalog
    }

    pub fn graph(&self) -> &DatasetGraph {
        &self.graph
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn register_generator(&mut self, descriptor: GeneratorDescriptor) -> SgResult<()> {
        self.graph.register_generator(descriptor, &self.catalog)?;
        *self.cache.write() = None;
        Ok(())
    }

    /// Drop the in-memory copy; the next call reloads or regenerates.
    pub fn clear_cache(&self) {
        *self.cache.write() = None;
    }

    /// Log and return the expected size of the generated datasets.
    pub fn estimate_data_size(&self) -> DataSizeEstimate {
        let num_samples = self.config.generator.num_samples;
        let datasets: Vec<(String, usize, u64)> = self
            .graph
            .entries()
            .iter()
            .map(|entry| {
                let bytes = (num_samples * entry.width() * std::mem::size_of::<f64>()) as u64;
                (entry.name().to_string(), entry.width(), bytes)
            })
            .collect();
        let estimate = DataSizeEstimate { num_samples, datasets };

        tracing::info!("Number of samples: {}", group_digits(num_samples));
        for (name, columns, bytes) in &estimate.datasets {
            tracing::info!("Dataset {}: {} columns, {}", name, columns, format_bytes(*bytes));
        }
        tracing::info!("Total size: {}", format_bytes(estimate.total_bytes()));
        estimate
    }

    /// Load the experiment's datasets from the store, or generate and save
    /// them. The result is kept in memory for subsequent calls.
    pub fn generate_training_data(&self) -> SgResult<Arc<TrainingData>> {
        if let Some(data) = self.cache.read().as_ref() {
            return Ok(Arc::clone(data));
        }

        // fails on cycles before any dataset is touched
        let order = self.graph.generation_order()?;
        let key = self.store.cache_key(&self.config.generation_params())?;

        let data = match self.load_cached(&order, &key)? {
            Some(data) => data,
            None => self.generate(&order, key)?,
        };

        let data = Arc::new(data);
        *self.cache.write() = Some(Arc::clone(&data));
        Ok(data)
    }

    fn load_cached(&self, order: &[String], key: &CacheKey) -> SgResult<Option<TrainingData>> {
        if self.config.generator.overwrite_existing {
            tracing::info!("Overwriting existing datasets for key {}", key);
            return Ok(None);
        }

        let datasets = order
            .iter()
            .map(|name| {
                self.graph
                    .get(name)
                    .map(|entry| (name.as_str(), entry.columns.as_slice()))
                    .ok_or_else(|| DatasetError::UnknownDataset { name: name.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        match self.store.load(&datasets, key) {
            Ok(Some(loaded)) => {
                tracing::info!(
                    "Loaded {} cached datasets for key {} ({} rows removed)",
                    loaded.tables.len(),
                    key,
                    loaded.removed_rows
                );
                Ok(Some(TrainingData {
                    tables: loaded.tables,
                    removed_rows: loaded.removed_rows,
                    error_count: 0,
                    key: key.clone(),
                    from_cache: true,
                }))
            }
            Ok(None) => {
                tracing::info!("No cached datasets for key {}; generating", key);
                Ok(None)
            }
            Err(e) if e.is_cache_miss() => {
                tracing::warn!("Cached datasets for key {} are unusable ({}); regenerating", key, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn generate(&self, order: &[String], key: CacheKey) -> SgResult<TrainingData> {
        self.estimate_data_size();

        let mut completed: BTreeMap<String, Table> = BTreeMap::new();
        let mut error_count = 0;
        for name in order {
            if self.cancel.is_cancelled() {
                return Err(SgError::Cancelled);
            }
            let entry = self
                .graph
                .get(name)
                .ok_or_else(|| DatasetError::UnknownDataset { name: name.clone() })?;

            tracing::info!("Generating dataset {}", name);
            let (table, errors) = self.generate_dataset(entry, &completed)?;
            error_count += errors;
            completed.insert(name.clone(), table);
        }

        if let Err(e) = self.store.save(&completed, &key) {
            tracing::error!("Failed to save datasets for key {}: {}", key, e);
        }

        let removed_rows = DatasetStore::filter_non_finite(&mut completed)?;
        tracing::info!(
            "Generated {} datasets; {} failed samples, {} rows removed",
            completed.len(),
            error_count,
            removed_rows
        );

        Ok(TrainingData {
            tables: completed,
            removed_rows,
            error_count,
            key,
            from_cache: false,
        })
    }

    fn generate_dataset(&self, entry: &DatasetEntry, completed: &BTreeMap<String, Table>) -> SgResult<(Table, usize)> {
        let num_samples = self.config.generator.num_samples;
        let width = entry.width();
        let inputs = DatasetInputs::for_entry(entry, completed)?;

        match &entry.descriptor.kind {
            GeneratorKind::WholeBatch(generator) => {
                let ctx = BatchContext {
                    dataset: entry.name(),
                    num_samples,
                    catalog: &self.catalog,
                    config: &self.config.generator,
                    inputs: &inputs,
                };
                let values = generator(&ctx)?;
                if values.len() != num_samples * width {
                    return Err(DatasetError::RowCountMismatch {
                        dataset: entry.name().to_string(),
                        expected: num_samples,
                        actual: values.len() / width.max(1),
                    }
                    .into());
                }
                Ok((Table::new(entry.columns.clone(), values)?, 0))
            }
            GeneratorKind::PerSample(generator) => {
                let mut executor = ParallelSampleGenerator::new(self.executor_config.clone())
                    .with_cancel_flag(self.cancel.clone());
                if let Some(launcher) = &self.launcher {
                    executor = executor.with_launcher(Arc::clone(launcher), self.config.session.clone());
                }
                if let Some(checkpoint) = &self.checkpoint {
                    executor = executor.with_checkpoint(Arc::clone(checkpoint));
                }

                let job = SampleJob {
                    dataset: entry.name(),
                    num_samples,
                    width,
                    needs_external_compute: entry.descriptor.needs_external_compute,
                    generator,
                    catalog: &self.catalog,
                    config: &self.config.generator,
                    inputs: &inputs,
                };
                let batch = executor.run(&job, &mut self.notifier.lock())?;

                let total = batch.sample_time().as_secs_f64();
                tracing::info!(
                    "[{}]: total time spent: {:.3}s, average time per sample: {:.3}s",
                    entry.name(),
                    total,
                    total / num_samples.max(1) as f64
                );
                Ok((Table::new(entry.columns.clone(), batch.values)?, batch.error_count))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SampleContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn catalog() -> Arc<ParameterCatalog> {
        let mut catalog = ParameterCatalog::new();
        for (name, domain, role) in [("A1", "a", Role::Feature), ("A2", "a", Role::Feature), ("B1", "b", Role::Target)] {
            let roles = BTreeMap::from([("net".to_string(), role)]);
            catalog.register(name, domain, roles, BTreeMap::new(), 0.0, 10.0).unwrap();
        }
        catalog.finalize().unwrap();
        Arc::new(catalog)
    }

    fn config(dir: &TempDir) -> HarnessConfig {
        let mut config = HarnessConfig::new("unit");
        config.generator = config.generator.with_samples(8).with_threads(2).with_data_root(dir.path());
        config.generator.progress_report_interval_secs = 0.01;
        config
    }

    /// `a` is whole-batch with rows `[i, 2i]`; `b` sums them per sample.
    fn generator(config: HarnessConfig, calls: Arc<Mutex<Vec<String>>>) -> DataGenerator {
        let mut generator = DataGenerator::new(config, catalog()).unwrap();

        let log = Arc::clone(&calls);
        generator
            .register_generator(
                GeneratorDescriptor::per_sample("b", "b", move |ctx: &mut SampleContext<'_>| {
                    log.lock().push(format!("b{}", ctx.sample_index));
                    let row = ctx.input_row("a")?;
                    Ok(vec![row[0] + row[1]])
                })
                .depends_on(&["a"]),
            )
            .unwrap();

        let log = Arc::clone(&calls);
        generator
            .register_generator(GeneratorDescriptor::whole_batch("a", "a", move |ctx: &BatchContext<'_>| {
                log.lock().push("a".to_string());
                Ok((0..ctx.num_samples).flat_map(|i| [i as f64, 2.0 * i as f64]).collect())
            }))
            .unwrap();
        generator
    }

    #[test]
    fn test_dependencies_generated_first() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let generator = generator(config(&dir), Arc::clone(&calls));

        let data = generator.generate_training_data().unwrap();
        assert!(!data.from_cache);
        assert_eq!(data.error_count, 0);
        assert_eq!(data.table("b").unwrap().column("B1").unwrap()[3], 9.0);

        let calls = calls.lock();
        assert_eq!(calls[0], "a");
        assert_eq!(calls.len(), 9);
    }

    #[test]
    fn test_cycle_generates_nothing() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut generator = DataGenerator::new(config(&dir), catalog()).unwrap();
        for (name, domain, dependency) in [("a", "a", "b"), ("b", "b", "a")] {
            let calls = Arc::clone(&calls);
            generator
                .register_generator(
                    GeneratorDescriptor::whole_batch(name, domain, move |_: &BatchContext<'_>| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Vec::new())
                    })
                    .depends_on(&[dependency]),
                )
                .unwrap();
        }

        let result = generator.generate_training_data();
        assert!(matches!(result, Err(SgError::Dataset(DatasetError::CyclicDependency { .. }))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!generator.store().experiment_dir().exists());
    }

    #[test]
    fn test_second_run_loads_from_store() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = generator(config(&dir), Arc::clone(&calls))
            .generate_training_data()
            .unwrap();

        calls.lock().clear();
        let generator = generator(config(&dir), Arc::clone(&calls));
        let second = generator.generate_training_data().unwrap();

        assert!(second.from_cache);
        assert!(calls.lock().is_empty());
        assert_eq!(first.key, second.key);
        assert_eq!(first.tables, second.tables);

        // memory cache
        assert!(Arc::ptr_eq(&second, &generator.generate_training_data().unwrap()));
    }

    #[test]
    fn test_overwrite_and_config_changes_regenerate() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        generator(config(&dir), Arc::clone(&calls)).generate_training_data().unwrap();

        let mut overwrite = config(&dir);
        overwrite.generator.overwrite_existing = true;
        assert!(!generator(overwrite, Arc::clone(&calls)).generate_training_data().unwrap().from_cache);

        let mut reseeded = config(&dir);
        reseeded.generator.random_seed = 7;
        assert!(!generator(reseeded, Arc::clone(&calls)).generate_training_data().unwrap().from_cache);
    }

    #[test]
    fn test_corrupted_cache_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let data = generator(config(&dir), Arc::clone(&calls)).generate_training_data().unwrap();

        let store = DatasetStore::new(dir.path(), "unit", &config(&dir).generator.file_template);
        std::fs::write(store.dataset_path("b", &data.key).unwrap(), b"not parquet").unwrap();

        let again = generator(config(&dir), Arc::clone(&calls)).generate_training_data().unwrap();
        assert!(!again.from_cache);
        assert_eq!(again.tables, data.tables);
    }

    #[test]
    fn test_unreadable_manifest_regenerates() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let data = generator(config(&dir), Arc::clone(&calls)).generate_training_data().unwrap();

        let store = DatasetStore::new(dir.path(), "unit", &config(&dir).generator.file_template);
        std::fs::write(store.manifest_path(&data.key), [0xff, 0xfe, 0x00, 0x7b]).unwrap();

        let again = generator(config(&dir), Arc::clone(&calls)).generate_training_data().unwrap();
        assert!(!again.from_cache);
        assert_eq!(again.tables, data.tables);
    }

    #[test]
    fn test_failed_samples_are_filtered_jointly() {
        let dir = TempDir::new().unwrap();
        let mut generator = DataGenerator::new(config(&dir), catalog()).unwrap();
        generator
            .register_generator(GeneratorDescriptor::whole_batch("a", "a", |ctx: &BatchContext<'_>| {
                Ok(vec![1.0; ctx.num_samples * 2])
            }))
            .unwrap();
        generator
            .register_generator(
                GeneratorDescriptor::per_sample("b", "b", |ctx: &mut SampleContext<'_>| {
                    if ctx.sample_index == 5 {
                        Err(sg_types::internal_error!("no focus found"))
                    } else {
                        Ok(vec![ctx.sample_index as f64])
                    }
                })
                .depends_on(&["a"]),
            )
            .unwrap();

        let data = generator.generate_training_data().unwrap();
        assert_eq!(data.error_count, 1);
        assert_eq!(data.removed_rows, 1);
        assert_eq!(data.num_rows(), 7);
        assert_eq!(data.table("a").unwrap().num_rows(), 7);
        assert!(!data.table("b").unwrap().column("B1").unwrap().contains(&5.0));

        let features = data.extract(generator.catalog(), &["a", "b"], "net", Role::Feature).unwrap();
        assert_eq!(features.columns(), &["A1".to_string(), "A2".to_string()]);
        let targets = data.extract(generator.catalog(), &["a", "b"], "net", Role::Target).unwrap();
        assert_eq!(targets.width(), 1);
    }

    #[test]
    fn test_wrong_batch_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut generator = DataGenerator::new(config(&dir), catalog()).unwrap();
        generator
            .register_generator(GeneratorDescriptor::whole_batch("a", "a", |_: &BatchContext<'_>| {
                Ok(vec![0.0; 4])
            }))
            .unwrap();
        assert!(matches!(
            generator.generate_training_data(),
            Err(SgError::Dataset(DatasetError::RowCountMismatch { .. }))
        ));
    }

    #[test]
    fn test_cancelled_run_saves_nothing() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let generator = generator(config(&dir), calls);
        generator.cancel_flag().cancel();

        assert!(matches!(generator.generate_training_data(), Err(SgError::Cancelled)));
        assert!(!generator.store().experiment_dir().exists());
    }

    #[test]
    fn test_size_estimate() {
        let dir = TempDir::new().unwrap();
        let generator = generator(config(&dir), Arc::new(Mutex::new(Vec::new())));
        let estimate = generator.estimate_data_size();
        assert_eq!(estimate.datasets[0], ("b".to_string(), 1, 64));
        assert_eq!(estimate.total_bytes(), 8 * 3 * 8);
    }
}
