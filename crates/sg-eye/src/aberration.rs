//! Wavefront aberrations of sampled eyes.

use serde_json::{json, Map, Value};
use sg_engine::{GeneratorDescriptor, SampleContext};
use sg_types::{config_error, ComputeError, GeneratorConfig, SgResult};

use crate::eye::EYE_DATASET;
use crate::simulator::{
    with_eye, COMPUTE_ABERRATIONS, GET_ABERRATIONS, GET_EYE_PARAMETER, MAKE_ELEMENTS, SET_EYE_PARAMETERS,
    VALIDATE_ABERRATIONS,
};

pub const ABERRATION_DATASET: &str = "aberration";
pub const ABERRATION_DOMAIN: &str = "aberration";

/// Simulator option holding overrides for the ray-trace options.
pub const COMPUTE_OPTIONS_KEY: &str = "compute_options";

pub fn aberration_descriptor() -> GeneratorDescriptor {
    GeneratorDescriptor::per_sample(ABERRATION_DATASET, ABERRATION_DOMAIN, compute_aberrations)
        .with_external_compute()
        .depends_on(&[EYE_DATASET])
}

/// Ray-trace options for `ComputeAberrations`.
///
/// `num_rays`, `max_degree` and `grid_shape` come from the simulator
/// options; any key in `compute_options` overrides the defaults.
pub fn compute_options(config: &GeneratorConfig) -> SgResult<Value> {
    let grid_shape = config
        .simulator
        .get("grid_shape")
        .cloned()
        .ok_or_else(|| config_error!("simulator option 'grid_shape' is required"))?;

    let mut options = json!({
        "NumRays": config.simulator_usize("num_rays")? as f64,
        "MaxDegree": config.simulator_usize("max_degree")?,
        "TraceVectors": "chief",
        "TraceVectorsEye": "input",
        "TraceVectorsRays": 100.0,
        "TraceVectorsTol": 1e-6,
        "IgnoreMissed": true,
        "IgnoreBlocked": true,
        "IgnoreTIR": true,
        "GridShape": grid_shape,
        "GridSpread": "trace",
        "GridFitPasses": 3,
        "CaptureDistance": 1e-1,
        "CaptureSize": 1e6,
        "RadiusThreshold": 1.0,
        "ProjectionMethod": "parallel",
        "CircumscribeRays": "expected",
        "CircumscribeShape": "ellipse",
        "CircumscribeExtension": "mirror",
        "EllipsePrecision": 2e-4,
        "Centering": "chief",
        "Stretching": "ellipse2circle",
        "PupilRounding": 0.001,
        "FitMethod": "lsq",
    });

    match config.simulator.get(COMPUTE_OPTIONS_KEY) {
        None => {}
        Some(Value::Object(overrides)) => {
            if let Value::Object(base) = &mut options {
                merge(base, overrides);
            }
        }
        Some(_) => return Err(config_error!("simulator option '{}' must be an object", COMPUTE_OPTIONS_KEY)),
    }
    Ok(options)
}

fn merge(base: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
}

/// Trace one eye and return its aberration coefficients.
pub fn compute_aberrations(ctx: &mut SampleContext<'_>) -> SgResult<Vec<f64>> {
    let eye_table = ctx.inputs.get(EYE_DATASET)?;
    let names: Vec<Value> = eye_table.columns().iter().map(|c| Value::from(c.as_str())).collect();
    let values: Vec<Value> = ctx.input_row(EYE_DATASET)?.iter().map(|v| Value::from(*v)).collect();
    let options = compute_options(ctx.config)?;

    with_eye(ctx.session()?, |session, eye| {
        *eye = session.invoke(
            "Set parameters",
            SET_EYE_PARAMETERS,
            &[eye.clone(), Value::Array(names), Value::Array(values)],
        )?;
        *eye = session.invoke("Make eye elements", MAKE_ELEMENTS, &[eye.clone()])?;
        session.invoke("Compute eye aberrations", COMPUTE_ABERRATIONS, &[eye.clone(), options])?;

        let aberrations: Vec<f64> = session.invoke_as("Extract aberrations", GET_ABERRATIONS, &[eye.clone()])?;

        // second retrieval must match bit for bit
        let check: Vec<f64> =
            session.invoke_as("Verification", GET_EYE_PARAMETER, &[eye.clone(), Value::from("Alpha")])?;
        if aberrations != check {
            return Err(ComputeError::VerificationFailed { stage: "Verification".to_string() }.into());
        }

        session.invoke(
            "Simulator validation",
            VALIDATE_ABERRATIONS,
            &[eye.clone(), json!(aberrations)],
        )?;
        Ok(aberrations)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{eye_params, harness, test_config};
    use crate::Experiment;
    use sg_compute::{LocalFault, LocalLauncher};
    use sg_types::SgError;
    use tempfile::TempDir;

    /// Aberrations of the fake simulator: `[AxialLength / 10, LensD, -AqueousT]`.
    fn fake_aberrations(eye: &Value) -> Value {
        let p = &eye["params"];
        json!([
            p["AxialLength"].as_f64().unwrap_or(f64::NAN) / 10.0,
            p["LensD"].as_f64().unwrap_or(f64::NAN),
            -p["AqueousT"].as_f64().unwrap_or(f64::NAN),
        ])
    }

    fn fake_simulator(verification_offset: f64) -> LocalLauncher {
        LocalLauncher::new(move |_, op, args| match op {
            "EyeParametric" => Ok(json!({ "params": {} })),
            "SetEyeParameters" => {
                let mut eye = args[0].clone();
                let names = args[1].as_array().cloned().unwrap_or_default();
                let values = args[2].as_array().cloned().unwrap_or_default();
                for (name, value) in names.iter().zip(values) {
                    eye["params"][name.as_str().unwrap_or_default()] = value;
                }
                Ok(eye)
            }
            "MakeElements" => Ok(args[0].clone()),
            "ComputeAberrations" => {
                if args[1]["NumRays"] != json!(1000.0) {
                    return Err(LocalFault::Error("unexpected ray count".into()));
                }
                Ok(Value::Null)
            }
            "GetAberrations" => Ok(fake_aberrations(&args[0])),
            "GetEyeParameter" => {
                let mut alpha = fake_aberrations(&args[0]);
                alpha[0] = json!(alpha[0].as_f64().unwrap_or(0.0) + verification_offset);
                Ok(alpha)
            }
            "ValidateAberrations" => Ok(Value::Bool(true)),
            "DeleteSelf" => Ok(Value::Null),
            _ => Err(LocalFault::Error(format!("Undefined function '{op}'"))),
        })
    }

    #[test]
    fn test_compute_options_overrides() {
        let mut config = test_config().generator;
        config
            .simulator
            .insert(COMPUTE_OPTIONS_KEY.to_string(), json!({ "GridFitPasses": 5 }));
        let options = compute_options(&config).unwrap();
        assert_eq!(options["GridFitPasses"], json!(5));
        assert_eq!(options["MaxDegree"], json!(20));
        assert_eq!(options["FitMethod"], json!("lsq"));

        config.simulator.remove("grid_shape");
        assert!(compute_options(&config).is_err());
    }

    #[test]
    fn test_aberration_dataset() {
        let dir = TempDir::new().unwrap();
        let generator = harness(&dir, Experiment::EyeAberrations, fake_simulator(0.0));
        let data = generator.generate_training_data().unwrap();

        assert_eq!(data.error_count, 0);
        assert_eq!(data.num_rows(), 12);
        let eyes = data.table(EYE_DATASET).unwrap();
        let aberrations = data.table(ABERRATION_DATASET).unwrap();
        assert_eq!(aberrations.columns(), &["Z1".to_string(), "Z2".to_string(), "Z3".to_string()]);

        for i in 0..12 {
            let (axial, lens, aqueous) = eye_params(eyes, i);
            assert_eq!(aberrations.row(i).unwrap(), &[axial / 10.0, lens, -aqueous]);
        }
    }

    #[test]
    fn test_failed_verification_leaves_no_rows() {
        let dir = TempDir::new().unwrap();
        let generator = harness(&dir, Experiment::EyeAberrations, fake_simulator(1e-12));

        let data = generator.generate_training_data().unwrap();
        // two consecutive failures stop each of the two workers
        assert_eq!(data.error_count, 4);
        assert_eq!(data.num_rows(), 0);
        assert_eq!(data.removed_rows, 12);
    }

    #[test]
    fn test_missing_simulator_options_fail_samples() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.generator.simulator.clear();
        let generator = crate::tests::harness_with(&dir, config, Experiment::EyeAberrations, fake_simulator(0.0));

        let data = generator.generate_training_data().unwrap();
        assert_eq!(data.num_rows(), 0);
        assert!(matches!(
            compute_options(&generator.config().generator),
            Err(SgError::Config(_))
        ));
    }
}
