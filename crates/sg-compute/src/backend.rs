//! Simulator backend abstraction
//!
//! A backend is one running simulator instance. It accepts named operations
//! with positional JSON arguments and returns a JSON result or an error
//! message. Launchers create backends for a given worker.

use serde_json::Value;
use sg_types::{SessionConfig, SgResult};

/// Operation used by the liveness probe.
pub const HEALTH_PROBE_OP: &str = "power";

/// Operation used to extend the simulator's script search path.
pub const ADD_PATH_OP: &str = "addpath";

/// One running simulator instance, owned by exactly one worker.
pub trait SimulatorBackend: Send {
    /// Forward a single operation to the simulator.
    fn call(&mut self, operation: &str, args: &[Value]) -> Result<Value, String>;

    /// OS process id, if the backend runs out of process.
    fn pid(&self) -> Option<u32>;

    /// Release the instance. Must be safe to call on a dead instance.
    fn terminate(&mut self);

    fn backend_type(&self) -> BackendType;
}

/// Creates simulator instances for workers.
pub trait SimulatorLauncher: Send + Sync {
    /// Launch one instance for `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance could not be started or configured.
    fn launch(&self, worker_id: usize, config: &SessionConfig) -> SgResult<Box<dyn SimulatorBackend>>;
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Child process speaking line-delimited JSON
    Process,

    /// In-process Rust implementation
    Local,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "Process"),
            Self::Local => write!(f, "Local"),
        }
    }
}

/// Arguments of the liveness probe: `power(2, 2)` must return 4.
pub fn health_probe_args() -> [Value; 2] {
    [Value::from(2.0), Value::from(2.0)]
}

/// Whether a probe response is the expected value.
pub fn is_healthy_probe_result(value: &Value) -> bool {
    value.as_f64() == Some(4.0)
}
