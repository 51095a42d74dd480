//! Eye model operations exposed by the simulator.

use serde_json::Value;
use sg_compute::ExternalComputeSession;
use sg_types::SgResult;

pub const EYE_PARAMETRIC: &str = "EyeParametric";
pub const PROPERTIES: &str = "properties";
pub const SET_EYE_PARAMETERS: &str = "SetEyeParameters";
pub const SET_EYE_PARAMETER: &str = "SetEyeParameter";
pub const GET_EYE_PARAMETER: &str = "GetEyeParameter";
pub const MAKE_ELEMENTS: &str = "MakeElements";
pub const COMPUTE_ABERRATIONS: &str = "ComputeAberrations";
pub const GET_ABERRATIONS: &str = "GetAberrations";
pub const VALIDATE_ABERRATIONS: &str = "ValidateAberrations";
pub const FOCUS_AT: &str = "FocusAt";
pub const DELETE_SELF: &str = "DeleteSelf";

/// Construct an eye instance, run `f` on it and delete it again.
///
/// `f` may replace the handle (operations return the updated eye). The
/// instance is deleted on failure too; a delete error only fails the
/// sample when `f` succeeded.
pub fn with_eye<T, F>(session: &mut ExternalComputeSession, f: F) -> SgResult<T>
where
    F: FnOnce(&mut ExternalComputeSession, &mut Value) -> SgResult<T>,
{
    let mut eye = session.invoke("Eye construction", EYE_PARAMETRIC, &[])?;
    let result = f(session, &mut eye);
    let deleted = delete_eye(session, "Delete the eye instance", eye);
    match (result, deleted) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}

pub fn delete_eye(session: &mut ExternalComputeSession, stage: &str, eye: Value) -> SgResult<()> {
    session.invoke(stage, DELETE_SELF, &[eye]).map(|_| ())
}

/// `GetEyeParameter(eye, name)` as a number.
pub fn eye_parameter(
    session: &mut ExternalComputeSession,
    stage: &str,
    eye: &Value,
    name: &str,
) -> SgResult<f64> {
    session.invoke_as(stage, GET_EYE_PARAMETER, &[eye.clone(), Value::from(name)])
}
