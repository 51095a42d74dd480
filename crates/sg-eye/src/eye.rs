//! Eye parameter sampling.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sg_data::ParameterCatalog;
use sg_engine::{BatchContext, GeneratorDescriptor};
use sg_types::{config_error, CatalogError, SgResult};

pub const EYE_DATASET: &str = "eye";
pub const EYE_DOMAIN: &str = "eye";

/// Eye parameter holding the focus distance in dioptres.
pub const FOCUS_PARAM: &str = "FocusDioptres";

/// `num_samples x width` uniform samples in `[0, 1)`, row-major.
pub fn uniform_samples(num_samples: usize, width: usize, seed: u64) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..num_samples * width).map(|_| rng.gen::<f64>()).collect()
}

/// `steps` evenly spaced values covering `[0, 1]`.
pub fn linspace(steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..steps).map(|i| i as f64 / (steps - 1) as f64).collect(),
    }
}

/// Uniformly sampled eye parameters, denormalized to their catalog ranges.
pub fn sample_eye_params(catalog: &ParameterCatalog, num_samples: usize, seed: u64) -> SgResult<Vec<f64>> {
    let width = catalog.domain_len(EYE_DOMAIN)?;
    catalog.denormalize(EYE_DOMAIN, &uniform_samples(num_samples, width, seed))
}

/// Eye parameters for refocusing: `num_focus_steps` evenly spaced focus
/// values, each paired with the same `num_samples / num_focus_steps`
/// random eyes.
pub fn sample_refocus_eye_params(
    catalog: &ParameterCatalog,
    num_samples: usize,
    num_focus_steps: usize,
    seed: u64,
) -> SgResult<Vec<f64>> {
    if num_focus_steps == 0 || num_samples % num_focus_steps != 0 {
        return Err(config_error!(
            "num_samples ({}) must be a multiple of num_focus_steps ({})",
            num_samples,
            num_focus_steps
        ));
    }

    let columns = catalog.domain_columns(EYE_DOMAIN)?;
    let focus = columns
        .iter()
        .position(|c| c == FOCUS_PARAM)
        .ok_or_else(|| CatalogError::UnknownParameter { name: FOCUS_PARAM.to_string() })?;
    let width = columns.len();
    let per_focus = num_samples / num_focus_steps;
    let eyes = uniform_samples(per_focus, width, seed);

    let mut normalized = Vec::with_capacity(num_samples * width);
    for focus_value in linspace(num_focus_steps) {
        for eye in eyes.chunks(width) {
            let start = normalized.len();
            normalized.extend_from_slice(eye);
            normalized[start + focus] = focus_value;
        }
    }
    catalog.denormalize(EYE_DOMAIN, &normalized)
}

pub fn eye_descriptor() -> GeneratorDescriptor {
    GeneratorDescriptor::whole_batch(EYE_DATASET, EYE_DOMAIN, |ctx: &BatchContext<'_>| {
        sample_eye_params(ctx.catalog, ctx.num_samples, ctx.config.random_seed)
    })
}

/// Eye dataset with a focus sweep; reads `num_focus_steps` from the
/// simulator options.
pub fn refocus_eye_descriptor() -> GeneratorDescriptor {
    GeneratorDescriptor::whole_batch(EYE_DATASET, EYE_DOMAIN, |ctx: &BatchContext<'_>| {
        let steps = ctx.config.simulator_usize("num_focus_steps")?;
        sample_refocus_eye_params(ctx.catalog, ctx.num_samples, steps, ctx.config.random_seed)
    })
}
