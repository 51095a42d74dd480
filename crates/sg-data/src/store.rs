use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sg_types::{CatalogError, GenerationParams, MacroScope, SgError, SgResult, StoreError, Table};
use uuid::Uuid;

const DATASET_FORMAT: &str = "parquet";

/// Content address of one set of generated datasets.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    pub id: Uuid,
    pub params: GenerationParams,
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id.simple())
    }
}

/// Sidecar file describing the configuration a dataset set was built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub datasets: Vec<String>,
    pub params: GenerationParams,
}

/// Tables returned by [`DatasetStore::load`].
#[derive(Debug, Clone)]
pub struct LoadedDatasets {
    pub tables: BTreeMap<String, Table>,
    /// Rows dropped by the joint non-finite filter.
    pub removed_rows: usize,
}

/// Persists named datasets as Parquet files keyed by generation parameters.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    pub data_root: PathBuf,
    experiment: String,
    file_template: String,
}

impl DatasetStore {
    pub fn new<P: AsRef<Path>>(data_root: P, experiment: &str, file_template: &str) -> Self {
        Self {
            data_root: data_root.as_ref().to_path_buf(),
            experiment: experiment.to_string(),
            file_template: file_template.to_string(),
        }
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.data_root.join(&self.experiment)
    }

    /// Deterministic key over the canonical JSON of `params`.
    pub fn cache_key(&self, params: &GenerationParams) -> SgResult<CacheKey> {
        let namespace = Uuid::new_v5(
            &Uuid::NAMESPACE_DNS,
            format!("train.{}", params.experiment).as_bytes(),
        );
        let canonical = serde_json::to_vec(params)?;
        Ok(CacheKey {
            id: Uuid::new_v5(&namespace, &canonical),
            params: params.clone(),
        })
    }

    pub fn dataset_path(&self, name: &str, key: &CacheKey) -> SgResult<PathBuf> {
        let mut scope = MacroScope::new();
        scope
            .set("experiment", &self.experiment)
            .set("dataset", name)
            .set("key", key)
            .set("format", DATASET_FORMAT);
        Ok(self.data_root.join(scope.resolve(&self.file_template)?))
    }

    pub fn manifest_path(&self, key: &CacheKey) -> PathBuf {
        self.experiment_dir().join(format!("params_{key}.json"))
    }

    /// Load every `(name, columns)` dataset for `key`.
    ///
    /// Returns `Ok(None)` when any file is missing. Short datasets, column
    /// layout changes, manifest mismatches and unreadable files surface as
    /// errors for which [`SgError::is_cache_miss`] holds.
    pub fn load(&self, datasets: &[(&str, &[String])], key: &CacheKey) -> SgResult<Option<LoadedDatasets>> {
        let manifest_path = self.manifest_path(key);
        if !manifest_path.exists() {
            tracing::debug!("No manifest at {}", manifest_path.display());
            return Ok(None);
        }
        let manifest = Self::read_manifest(&manifest_path)?;
        if manifest.params != key.params {
            return Err(StoreError::ManifestMismatch { key: key.to_string() }.into());
        }

        let expected = key.params.num_samples;
        let mut tables = BTreeMap::new();
        for (name, columns) in datasets {
            let path = self.dataset_path(name, key)?;
            if !path.exists() {
                tracing::debug!("Dataset {} missing at {}", name, path.display());
                return Ok(None);
            }

            let mut table = Self::read_parquet(&path)?;
            if table.columns() != *columns {
                return Err(StoreError::ColumnMismatch {
                    name: name.to_string(),
                    expected: columns.to_vec(),
                    actual: table.columns().to_vec(),
                }
                .into());
            }
            if table.num_rows() < expected {
                return Err(StoreError::ShortDataset {
                    name: name.to_string(),
                    expected,
                    actual: table.num_rows(),
                }
                .into());
            }
            table.truncate(expected);
            tracing::info!("Loaded dataset {} ({} rows) from {}", name, table.num_rows(), path.display());
            tables.insert(name.to_string(), table);
        }

        let removed_rows = Self::filter_non_finite(&mut tables)?;
        Ok(Some(LoadedDatasets { tables, removed_rows }))
    }

    /// Write every table and the manifest for `key`.
    pub fn save(&self, tables: &BTreeMap<String, Table>, key: &CacheKey) -> SgResult<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(tables.len());
        for (name, table) in tables {
            let path = self.dataset_path(name, key)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Self::write_parquet(&path, table)?;
            tracing::info!("Saved dataset {} ({} rows) to {}", name, table.num_rows(), path.display());
            written.push(path);
        }

        let manifest = Manifest {
            key: key.to_string(),
            created_at: Utc::now(),
            datasets: tables.keys().cloned().collect(),
            params: key.params.clone(),
        };
        let manifest_path = self.manifest_path(key);
        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        Ok(written)
    }

    /// Drop every row index at which any table has a non-finite value.
    ///
    /// All tables must have the same number of rows. Returns the number of
    /// rows removed from each table.
    pub fn filter_non_finite(tables: &mut BTreeMap<String, Table>) -> SgResult<usize> {
        let rows = match tables.values().next() {
            Some(t) => t.num_rows(),
            None => return Ok(0),
        };
        if let Some((name, t)) = tables.iter().find(|(_, t)| t.num_rows() != rows) {
            return Err(CatalogError::ShapeMismatch {
                expected: format!("{rows} rows in every dataset"),
                actual: format!("{} rows in {}", t.num_rows(), name),
            }
            .into());
        }

        let all: Vec<&Table> = tables.values().collect();
        let mask: Vec<bool> = (0..rows)
            .into_par_iter()
            .map(|r| {
                all.iter()
                    .all(|t| t.row(r).map_or(true, |row| row.iter().all(|v| v.is_finite())))
            })
            .collect();

        let removed = mask.iter().filter(|keep| !**keep).count();
        if removed > 0 {
            for table in tables.values_mut() {
                table.retain_rows(&mask)?;
            }
            tracing::warn!("Removed {} of {} rows containing non-finite values", removed, rows);
        }
        Ok(removed)
    }

    /// Count and size the Parquet files below the experiment folder.
    pub fn stats(&self) -> SgResult<StorageStats> {
        fn scan_directory(path: &Path, stats: &mut (u64, u64)) -> std::io::Result<()> {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                let path = entry.path();

                if path.is_dir() {
                    scan_directory(&path, stats)?;
                } else if path.extension().and_then(|s| s.to_str()) == Some(DATASET_FORMAT) {
                    stats.0 += 1;
                    stats.1 += entry.metadata()?.len();
                }
            }
            Ok(())
        }

        let root = self.experiment_dir();
        let mut stats = (0u64, 0u64);
        if root.exists() {
            scan_directory(&root, &mut stats)?;
        }

        Ok(StorageStats {
            total_files: stats.0,
            total_size_bytes: stats.1,
            data_root: root,
        })
    }

    fn write_parquet(path: &Path, table: &Table) -> SgResult<()> {
        let schema = Arc::new(Schema::new(
            table
                .columns()
                .iter()
                .map(|name| Field::new(name, DataType::Float64, false))
                .collect::<Vec<_>>(),
        ));

        let arrays: Vec<ArrayRef> = table
            .columns()
            .iter()
            .map(|name| {
                let column = table.column(name).unwrap_or_default();
                Arc::new(Float64Array::from(column)) as ArrayRef
            })
            .collect();

        let batch = RecordBatch::try_new(schema.clone(), arrays)
            .map_err(|e| SgError::Arrow(e.to_string()))?;

        let file = fs::File::create(path)?;
        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(file, schema, Some(props))
            .map_err(|e| SgError::Parquet(e.to_string()))?;
        writer.write(&batch).map_err(|e| SgError::Parquet(e.to_string()))?;
        writer.close().map_err(|e| SgError::Parquet(e.to_string()))?;
        Ok(())
    }

    fn read_manifest(path: &Path) -> SgResult<Manifest> {
        let corrupted = |e: &dyn std::fmt::Display| StoreError::Corrupted {
            message: format!("Failed to read manifest {}: {}", path.display(), e),
        };
        let text = fs::read_to_string(path).map_err(|e| corrupted(&e))?;
        Ok(serde_json::from_str(&text).map_err(|e| corrupted(&e))?)
    }

    fn read_parquet(path: &Path) -> SgResult<Table> {
        let file = fs::File::open(path).map_err(|e| StoreError::Corrupted {
            message: format!("Failed to open {}: {}", path.display(), e),
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            StoreError::Corrupted {
                message: format!("Failed to create Parquet reader for {}: {}", path.display(), e),
            }
        })?;
        let columns: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let reader = builder.build().map_err(|e| StoreError::Corrupted {
            message: format!("Failed to build Parquet reader: {e}"),
        })?;

        let mut column_values: Vec<Vec<f64>> = vec![Vec::new(); columns.len()];
        for batch_result in reader {
            let batch = batch_result.map_err(|e| StoreError::Corrupted {
                message: format!("Failed to read Parquet batch: {e}"),
            })?;

            for (i, values) in column_values.iter_mut().enumerate() {
                let array = batch
                    .column(i)
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| StoreError::Corrupted {
                        message: format!("Column {} is not Float64", columns[i]),
                    })?;
                values.extend((0..array.len()).map(|r| {
                    if array.is_null(r) {
                        f64::NAN
                    } else {
                        array.value(r)
                    }
                }));
            }
        }

        let rows = column_values.first().map_or(0, Vec::len);
        let mut values = Vec::with_capacity(rows * columns.len());
        for r in 0..rows {
            values.extend(column_values.iter().map(|c| c[r]));
        }
        Table::new(columns, values)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub total_files: u64,
    pub total_size_bytes: u64,
    pub data_root: PathBuf,
}

impl StorageStats {
    pub fn total_size_mb(&self) -> f64 {
        self.total_size_bytes as f64 / (1024.0 * 1024.0)
    }
}
