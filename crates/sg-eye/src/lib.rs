//! Eye simulator experiments.
//!
//! Each experiment registers a whole-batch `eye` dataset of sampled eye
//! parameters and one per-sample dataset computed by the simulator.

use std::fmt;
use std::str::FromStr;

use sg_engine::{DataGenerator, GeneratorDescriptor};
use sg_types::{config_error, SgError, SgResult};

pub mod aberration;
pub mod eye;
pub mod refocus;
pub mod simulator;

pub use aberration::*;
pub use eye::*;
pub use refocus::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Experiment {
    /// Wavefront aberrations of randomly sampled eyes.
    EyeAberrations,
    /// Lens changes needed to focus sampled eyes at a sweep of distances.
    EyeRefocusing,
}

impl Experiment {
    pub const ALL: [Experiment; 2] = [Experiment::EyeAberrations, Experiment::EyeRefocusing];

    pub fn name(self) -> &'static str {
        match self {
            Experiment::EyeAberrations => "eye_aberrations",
            Experiment::EyeRefocusing => "eye_refocusing",
        }
    }

    pub fn descriptors(self) -> Vec<GeneratorDescriptor> {
        match self {
            Experiment::EyeAberrations => vec![eye_descriptor(), aberration_descriptor()],
            Experiment::EyeRefocusing => vec![refocus_eye_descriptor(), refocus_descriptor()],
        }
    }

    pub fn register(self, generator: &mut DataGenerator) -> SgResult<()> {
        for descriptor in self.descriptors() {
            generator.register_generator(descriptor)?;
        }
        tracing::info!("Registered experiment {} ({:?})", self, generator.graph().names());
        Ok(())
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Experiment {
    type Err = SgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| config_error!("Unknown experiment '{}'", s))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use sg_compute::LocalLauncher;
    use sg_data::{ParameterTableLoader, Role};
    use sg_engine::ExecutorConfig;
    use sg_types::{HarnessConfig, Table};
    use std::sync::Arc;
    use tempfile::TempDir;

    const PARAMETER_TABLE: &str = "\
name;domain;min;max;role_ann;weight_ann
AxialLength;eye;20;30;feature;
LensD;eye;3;5;feature;
AqueousT;eye;2;4;feature;
FocusDioptres;eye;0.5;4;feature;
Z1;aberration;-1;1;target;2
Z2;aberration;-1;1;target;1
Z3;aberration;-1;1;target;1
DeltaLensD;refocus;-1;1;target;1
DeltaAqueousT;refocus;-1;1;target;1
";

    pub(crate) fn test_config() -> HarnessConfig {
        let mut config = HarnessConfig::new("eye_test");
        config.generator = config
            .generator
            .with_samples(12)
            .with_threads(2)
            .with_simulator_option("num_rays", json!(1000))
            .with_simulator_option("max_degree", json!(20))
            .with_simulator_option("grid_shape", json!([16, 16]))
            .with_simulator_option("num_focus_steps", json!(3))
            .with_simulator_option("num_passes", json!(2))
            .with_simulator_option("num_subdivisions", json!(4));
        config.generator.progress_report_interval_secs = 0.01;
        config
    }

    pub(crate) fn harness(dir: &TempDir, experiment: Experiment, launcher: LocalLauncher) -> DataGenerator {
        harness_with(dir, test_config(), experiment, launcher)
    }

    pub(crate) fn harness_with(
        dir: &TempDir,
        mut config: HarnessConfig,
        experiment: Experiment,
        launcher: LocalLauncher,
    ) -> DataGenerator {
        config.generator.data_root = dir.path().to_path_buf();
        let catalog = ParameterTableLoader::new()
            .load_from_reader(PARAMETER_TABLE.as_bytes())
            .unwrap();
        let executor = ExecutorConfig::from_generator_config(&config.generator).with_max_cpus(2);

        let mut generator = DataGenerator::new(config, Arc::new(catalog))
            .unwrap()
            .with_launcher(Arc::new(launcher))
            .with_executor_config(executor);
        experiment.register(&mut generator).unwrap();
        generator
    }

    /// `(AxialLength, LensD, AqueousT)` of eye `i`.
    pub(crate) fn eye_params(eyes: &Table, i: usize) -> (f64, f64, f64) {
        (
            eyes.value(i, "AxialLength").unwrap(),
            eyes.value(i, "LensD").unwrap(),
            eyes.value(i, "AqueousT").unwrap(),
        )
    }

    #[test]
    fn test_experiment_names() {
        for experiment in Experiment::ALL {
            assert_eq!(experiment.name().parse::<Experiment>().unwrap(), experiment);
        }
        assert!("eye_flattening".parse::<Experiment>().is_err());
    }

    #[test]
    fn test_registered_graph() {
        let dir = TempDir::new().unwrap();
        let generator = harness(&dir, Experiment::EyeAberrations, LocalLauncher::new(|_, _, _| Ok(json!(null))));
        let graph = generator.graph();
        assert_eq!(graph.generation_order().unwrap(), vec![EYE_DATASET, ABERRATION_DATASET]);
        assert!(graph.get(EYE_DATASET).unwrap().descriptor.is_whole_batch());
        assert!(graph.get(ABERRATION_DATASET).unwrap().descriptor.needs_external_compute);
        assert_eq!(graph.get(ABERRATION_DATASET).unwrap().width(), 3);

        let catalog = generator.catalog();
        assert_eq!(catalog.filter_params("ann", Role::Feature).len(), 4);
        assert_eq!(catalog.target_weights("ann")[..3], [2.0, 1.0, 1.0]);
    }
}
