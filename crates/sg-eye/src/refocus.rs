//! Accommodation changes needed to refocus sampled eyes.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use sg_compute::ExternalComputeSession;
use sg_engine::{GeneratorDescriptor, SampleContext};
use sg_types::{ComputeError, SgResult};

use crate::eye::{EYE_DATASET, FOCUS_PARAM};
use crate::simulator::{delete_eye, eye_parameter, with_eye, FOCUS_AT, MAKE_ELEMENTS, PROPERTIES, SET_EYE_PARAMETER};

pub const REFOCUS_DATASET: &str = "refocus";
pub const REFOCUS_DOMAIN: &str = "refocus";

/// Reference wavelength for focusing, in nanometres.
const FOCUS_WAVELENGTH_NM: f64 = 587.56;

/// Lower bound of the lens diameter search, relative to the current one.
const MIN_LENS_DIAMETER_RATIO: f64 = 0.91;

pub fn refocus_descriptor() -> GeneratorDescriptor {
    GeneratorDescriptor::per_sample(REFOCUS_DATASET, REFOCUS_DOMAIN, compute_refocus)
        .with_external_compute()
        .depends_on(&[EYE_DATASET])
}

/// Focus one eye at `1 / FocusDioptres` and return
/// `[ΔLensD, ΔAqueousT]` between the refocused and the original eye.
pub fn compute_refocus(ctx: &mut SampleContext<'_>) -> SgResult<Vec<f64>> {
    let columns = ctx.inputs.get(EYE_DATASET)?.columns().to_vec();
    let params = ctx.input_row(EYE_DATASET)?.to_vec();
    let focus_dioptres = ctx.input_value(EYE_DATASET, FOCUS_PARAM)?;
    let lens_diameter = ctx.input_value(EYE_DATASET, "LensD")?;
    if focus_dioptres == 0.0 || !focus_dioptres.is_finite() {
        return Err(sg_types::validation_error!("cannot focus at {} dioptres", focus_dioptres));
    }
    let focus_distance = 1.0 / focus_dioptres;

    let config = ctx.config;
    let num_passes = config.simulator_usize("num_passes")?;
    let num_rays = config.simulator_usize("num_rays")? as f64;
    let num_subdivisions = config.simulator_usize("num_subdivisions")?;

    with_eye(ctx.session()?, |session, eye| {
        let properties: BTreeSet<String> = session.invoke_as("Eye construction", PROPERTIES, &[eye.clone()])?;
        for (name, value) in columns.iter().zip(&params) {
            if !properties.contains(name) {
                continue;
            }
            *eye = session.invoke(
                &format!("Eye parameter: {name}"),
                SET_EYE_PARAMETER,
                &[eye.clone(), Value::from(name.as_str()), Value::from(*value)],
            )?;
        }
        *eye = session.invoke("Make eye elements", MAKE_ELEMENTS, &[eye.clone()])?;

        let outputs: Vec<Value> = session.invoke_as(
            "Eye refocusing",
            FOCUS_AT,
            &[
                eye.clone(),
                json!(focus_distance),
                json!(FOCUS_WAVELENGTH_NM),
                json!(num_passes),
                json!(num_rays),
                json!(num_subdivisions),
                json!([lens_diameter * MIN_LENS_DIAMETER_RATIO, lens_diameter]),
            ],
        )?;
        let refocused = outputs.into_iter().next().ok_or_else(|| ComputeError::UnexpectedResult {
            stage: "Eye refocusing".to_string(),
            message: "no refocused eye returned".to_string(),
        })?;

        let deltas = accommodation_deltas(session, eye, &refocused);
        let deleted = delete_eye(session, "Delete the refocused eye instance", refocused);
        let deltas = deltas?;
        deleted?;
        Ok(deltas)
    })
}

fn accommodation_deltas(
    session: &mut ExternalComputeSession,
    original: &Value,
    refocused: &Value,
) -> SgResult<Vec<f64>> {
    let original_ld = eye_parameter(session, "Get original lens diameter", original, "LensD")?;
    let original_acd = eye_parameter(session, "Get original ACD", original, "AqueousT")?;
    let refocused_ld = eye_parameter(session, "Get refocused lens diameter", refocused, "LensD")?;
    let refocused_acd = eye_parameter(session, "Get refocused ACD", refocused, "AqueousT")?;
    Ok(vec![refocused_ld - original_ld, refocused_acd - original_acd])
}
