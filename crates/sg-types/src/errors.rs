use thiserror::Error;

/// Main error type for the surrogate data generator
#[derive(Error, Debug)]
pub enum SgError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Generation cancelled")]
    Cancelled,
}

/// Parameter catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Parameter already registered: {name}")]
    DuplicateParameter { name: String },

    #[error("Parameter catalog has not been finalized")]
    NotBuilt,

    #[error("Parameter catalog is finalized; cannot register {name}")]
    AlreadyBuilt { name: String },

    #[error("Parameter {name} has a degenerate range [{min}, {max}]")]
    DegenerateRange { name: String, min: f64, max: f64 },

    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Unknown parameter domain: {domain}")]
    UnknownDomain { domain: String },

    #[error("Column {column} is not present in any source table")]
    UnknownColumn { column: String },

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Parameter table parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Dataset graph and generation errors
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset already registered: {name}")]
    DuplicateDataset { name: String },

    #[error("Unknown dataset: {name}")]
    UnknownDataset { name: String },

    #[error("Dataset {dataset} depends on unknown dataset {dependency}")]
    MissingDependency { dataset: String, dependency: String },

    #[error("Cyclic dependency between datasets: {pending:?}")]
    CyclicDependency { pending: Vec<String> },

    #[error("Dataset {dataset} expected {expected} values per row, got {actual}")]
    WidthMismatch {
        dataset: String,
        expected: usize,
        actual: usize,
    },

    #[error("Dataset {dataset} expected {expected} rows, got {actual}")]
    RowCountMismatch {
        dataset: String,
        expected: usize,
        actual: usize,
    },

    #[error("Dataset {dataset} has no simulator session available")]
    NoSession { dataset: String },
}

/// External simulator errors
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Simulator startup failed for worker {worker_id} after {attempts} attempts: {message}")]
    StartupFailed {
        worker_id: usize,
        attempts: u32,
        message: String,
    },

    #[error("Simulator call {operation} failed at stage '{stage}': {message}")]
    Call {
        stage: String,
        operation: String,
        message: String,
    },

    #[error("Simulator protocol error: {message}")]
    Protocol { message: String },

    #[error("Simulator session is not running")]
    NotRunning,

    #[error("Sample failed verification at stage '{stage}'")]
    VerificationFailed { stage: String },

    #[error("Unexpected simulator result at stage '{stage}': {message}")]
    UnexpectedResult { stage: String, message: String },
}

/// Dataset store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Dataset file not found: {path}")]
    Missing { path: String },

    #[error("Dataset {name} is too short: expected {expected} rows, found {actual}")]
    ShortDataset {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Dataset {name} has columns {actual:?}, expected {expected:?}")]
    ColumnMismatch {
        name: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Dataset file corrupted: {message}")]
    Corrupted { message: String },

    #[error("Manifest mismatch for key {key}")]
    ManifestMismatch { key: String },
}

/// Result type alias for generator operations
pub type SgResult<T> = Result<T, SgError>;

impl SgError {
    /// Store failures that should be treated as a cache miss rather than
    /// aborting the run.
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            SgError::Store(_) | SgError::Parquet(_) | SgError::Arrow(_) | SgError::Serialization(_)
        )
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::SgError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SgError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SgError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ComputeError::Call {
            stage: "Make eye elements".to_string(),
            operation: "MakeElements".to_string(),
            message: "index out of bounds".to_string(),
        };

        let text = error.to_string();
        assert!(text.contains("Make eye elements"));
        assert!(text.contains("MakeElements"));
        assert!(text.contains("index out of bounds"));
    }

    #[test]
    fn test_error_conversion() {
        let dataset_error = DatasetError::CyclicDependency {
            pending: vec!["a".into(), "b".into()],
        };
        let sg_error: SgError = dataset_error.into();

        match sg_error {
            SgError::Dataset(DatasetError::CyclicDependency { pending }) => {
                assert_eq!(pending.len(), 2)
            }
            _ => panic!("Expected Dataset error"),
        }
    }

    #[test]
    fn test_cache_miss_classification() {
        let missing: SgError = StoreError::Missing { path: "x".into() }.into();
        assert!(missing.is_cache_miss());
        assert!(!SgError::Cancelled.is_cache_miss());
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing required field: {}", "num_samples");
        assert!(config_err.to_string().contains("num_samples"));
    }
}
