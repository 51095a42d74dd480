//! Typed run configuration.
//!
//! A run is described by a single JSON document that deserializes into
//! [`HarnessConfig`]. Validation happens once, at load time, so the rest of
//! the generator can rely on the invariants documented on each field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::SgResult;
use crate::config_error;

/// Top-level configuration for one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Experiment name (e.g. "eye_aberrations"). Names the cache folder and
    /// seeds the cache key namespace.
    pub experiment: String,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl HarnessConfig {
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            generator: GeneratorConfig::default(),
            session: SessionConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }

    /// Read and validate a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SgResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("Unable to read {}: {}", path.display(), e))?;
        let config: HarnessConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SgResult<()> {
        if self.experiment.trim().is_empty() {
            return Err(config_error!("experiment name must not be empty"));
        }
        self.generator.validate()?;
        self.session.validate()?;
        self.notifications.validate()?;
        Ok(())
    }

    /// The subset of the configuration that determines generated content.
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            experiment: self.experiment.clone(),
            num_samples: self.generator.num_samples,
            random_seed: self.generator.random_seed,
            parameter_table: self
                .generator
                .parameter_table
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            simulator: self.generator.simulator.clone(),
        }
    }
}

/// Dataset generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Total number of samples per dataset.
    pub num_samples: usize,

    /// Requested worker threads; capped by the CPU count at run time.
    pub num_threads: usize,

    /// Regenerate even when a cached dataset exists.
    pub overwrite_existing: bool,

    pub random_seed: u64,

    /// `;`-delimited CSV describing the parameter catalog.
    pub parameter_table: PathBuf,

    /// Root folder for persisted datasets.
    pub data_root: PathBuf,

    /// Dataset file layout below `data_root`.
    pub file_template: String,

    pub progress_report_interval_secs: f64,

    /// Remote status interval; notifications are off when this is 0.
    pub notification_interval_secs: f64,

    /// Checkpoint hook interval; 0 disables checkpoints.
    pub checkpoint_interval_secs: f64,

    /// Consecutive per-sample failures after which a worker gives up.
    pub max_consecutive_failures: usize,

    /// Opaque simulator options (ray counts, polynomial degree, grid shape,
    /// tolerances). Passed through to the generators and part of the cache key.
    pub simulator: BTreeMap<String, serde_json::Value>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            num_samples: 1000,
            num_threads: 4,
            overwrite_existing: false,
            random_seed: 42,
            parameter_table: PathBuf::from("Data/GeneratorParameters/eye_params.csv"),
            data_root: PathBuf::from("Data/Train"),
            file_template: "${experiment}/${dataset}_${key}.${format}".to_string(),
            progress_report_interval_secs: 10.0,
            notification_interval_secs: 0.0,
            checkpoint_interval_secs: 0.0,
            max_consecutive_failures: 2,
            simulator: BTreeMap::new(),
        }
    }
}

impl GeneratorConfig {
    pub fn with_samples(mut self, n: usize) -> Self {
        self.num_samples = n;
        self
    }

    pub fn with_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    pub fn with_simulator_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.simulator.insert(key.to_string(), value);
        self
    }

    pub fn validate(&self) -> SgResult<()> {
        if self.num_samples == 0 {
            return Err(config_error!("num_samples must be positive"));
        }
        if self.num_threads == 0 {
            return Err(config_error!("num_threads must be positive"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(config_error!("max_consecutive_failures must be at least 1"));
        }
        for (name, value) in [
            ("progress_report_interval_secs", self.progress_report_interval_secs),
            ("notification_interval_secs", self.notification_interval_secs),
            ("checkpoint_interval_secs", self.checkpoint_interval_secs),
        ] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(config_error!("{} must be a non-negative number of seconds, got {}", name, value));
            }
        }
        if self.file_template.trim().is_empty() {
            return Err(config_error!("file_template must not be empty"));
        }
        Ok(())
    }

    /// Read an integer simulator option.
    pub fn simulator_usize(&self, key: &str) -> SgResult<usize> {
        self.simulator
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .ok_or_else(|| config_error!("simulator option '{}' must be a non-negative integer", key))
    }

    /// Read a floating point simulator option.
    pub fn simulator_f64(&self, key: &str) -> SgResult<f64> {
        self.simulator
            .get(key)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| config_error!("simulator option '{}' must be a number", key))
    }
}

/// Seconds as a [`Duration`], saturating at `Duration::MAX`. Negative and
/// NaN values map to zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 { Duration::MAX } else { Duration::ZERO })
}

/// OS scheduling priority for simulator processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessPriority {
    Idle,
    Normal,
    High,
    Realtime,
}

impl ProcessPriority {
    /// Equivalent Unix niceness.
    pub fn niceness(self) -> i32 {
        match self {
            Self::Idle => 19,
            Self::Normal => 0,
            Self::High => -10,
            Self::Realtime => -20,
        }
    }
}

impl Default for ProcessPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// How to launch one simulator process per worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Simulator executable speaking the line-delimited JSON protocol.
    pub program: PathBuf,

    pub args: Vec<String>,

    pub working_dir: Option<PathBuf>,

    /// Script folders added to the simulator search path on startup.
    pub script_paths: Vec<PathBuf>,

    /// Per-worker simulator logs are written here when set.
    pub log_dir: Option<PathBuf>,

    /// Pin worker `i`'s simulator to CPU `i`.
    pub set_affinity: bool,

    pub priority: ProcessPriority,

    /// Launch attempts before a worker gives up on its simulator.
    pub startup_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("simulator"),
            args: Vec::new(),
            working_dir: None,
            script_paths: Vec::new(),
            log_dir: None,
            set_affinity: true,
            priority: ProcessPriority::High,
            startup_attempts: 3,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> SgResult<()> {
        if self.startup_attempts == 0 {
            return Err(config_error!("startup_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Remote status notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,

    /// Slack-compatible incoming webhook.
    pub webhook_url: Option<String>,
}

impl NotificationConfig {
    pub fn validate(&self) -> SgResult<()> {
        if self.enabled && self.webhook_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(config_error!("notifications are enabled but no webhook_url is set"));
        }
        Ok(())
    }
}

/// Configuration values that determine the content of generated datasets.
///
/// Two runs with equal `GenerationParams` produce interchangeable data, so
/// this is what the dataset cache is keyed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub experiment: String,
    pub num_samples: usize,
    pub random_seed: u64,
    pub parameter_table: String,
    pub simulator: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = HarnessConfig::new("eye_aberrations");
        assert!(config.validate().is_ok());
        assert_eq!(config.generator.max_consecutive_failures, 2);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = HarnessConfig::new("eye_aberrations");
        config.generator.num_samples = 0;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::new("  ");
        config.generator.num_samples = 10;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::new("x");
        config.generator.progress_report_interval_secs = -1.0;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::new("x");
        config.generator.checkpoint_interval_secs = 1e30;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::new("x");
        config.notifications.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loads_partial_json_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "experiment": "eye_refocusing",
                "generator": {{ "num_samples": 64, "num_threads": 2, "simulator": {{ "num_rays": 1000 }} }},
                "session": {{ "priority": "idle" }}
            }}"#
        )
        .unwrap();

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.generator.num_samples, 64);
        assert_eq!(config.generator.random_seed, 42);
        assert_eq!(config.session.priority, ProcessPriority::Idle);
        assert_eq!(config.generator.simulator_usize("num_rays").unwrap(), 1000);
        assert!(config.generator.simulator_usize("max_degree").is_err());
    }

    #[test]
    fn test_secs_to_duration_saturates() {
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1500));
        assert_eq!(secs_to_duration(1e30), Duration::MAX);
        assert_eq!(secs_to_duration(f64::INFINITY), Duration::MAX);
        assert_eq!(secs_to_duration(-2.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_generation_params_ignore_runtime_settings() {
        let mut a = HarnessConfig::new("eye");
        let mut b = a.clone();
        b.generator.num_threads = 32;
        b.generator.overwrite_existing = true;
        b.session.priority = ProcessPriority::Idle;
        assert_eq!(a.generation_params(), b.generation_params());

        a.generator.random_seed = 7;
        assert_ne!(a.generation_params(), b.generation_params());
    }
}
