use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use sg_types::{ComputeError, SessionConfig, SgResult};

use crate::backend::{
    health_probe_args, is_healthy_probe_result, SimulatorBackend, SimulatorLauncher, HEALTH_PROBE_OP,
};

/// Managed handle to one simulator instance, owned by a single worker.
///
/// The instance is released exactly once: either by [`shutdown`] or, on
/// early exits and panics, when the session is dropped.
///
/// [`shutdown`]: ExternalComputeSession::shutdown
pub struct ExternalComputeSession {
    worker_id: usize,
    config: SessionConfig,
    launcher: Arc<dyn SimulatorLauncher>,
    backend: Option<Box<dyn SimulatorBackend>>,
    restarts: u32,
}

impl std::fmt::Debug for ExternalComputeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalComputeSession")
            .field("worker_id", &self.worker_id)
            .field("pid", &self.pid())
            .field("running", &self.backend.is_some())
            .field("restarts", &self.restarts)
            .finish()
    }
}

impl ExternalComputeSession {
    /// Launch a simulator for `worker_id`, retrying up to
    /// `config.startup_attempts` times.
    pub fn start(
        worker_id: usize,
        config: &SessionConfig,
        launcher: Arc<dyn SimulatorLauncher>,
    ) -> SgResult<Self> {
        let mut session = Self {
            worker_id,
            config: config.clone(),
            launcher,
            backend: None,
            restarts: 0,
        };
        session.launch()?;
        Ok(session)
    }

    fn launch(&mut self) -> SgResult<()> {
        let attempts = self.config.startup_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.launcher.launch(self.worker_id, &self.config) {
                Ok(mut backend) => {
                    let probe = backend.call(HEALTH_PROBE_OP, &health_probe_args());
                    if matches!(&probe, Ok(v) if is_healthy_probe_result(v)) {
                        tracing::info!(
                            worker_id = self.worker_id,
                            pid = ?backend.pid(),
                            "Simulator started ({})",
                            backend.backend_type()
                        );
                        self.backend = Some(backend);
                        return Ok(());
                    }
                    backend.terminate();
                    last_error = format!("startup probe failed: {probe:?}");
                }
                Err(e) => last_error = e.to_string(),
            }
            tracing::warn!(
                worker_id = self.worker_id,
                "Simulator startup attempt {}/{} failed: {}",
                attempt,
                attempts,
                last_error
            );
        }

        Err(ComputeError::StartupFailed {
            worker_id: self.worker_id,
            attempts,
            message: last_error,
        }
        .into())
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.backend.as_ref().and_then(|b| b.pid())
    }

    /// Number of restarts performed by [`restart_if_dead`](Self::restart_if_dead).
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Run the `power(2, 2) == 4` probe. Never fails; any error means dead.
    pub fn health_check(&mut self) -> bool {
        match self.backend.as_mut() {
            Some(backend) => matches!(
                backend.call(HEALTH_PROBE_OP, &health_probe_args()),
                Ok(ref v) if is_healthy_probe_result(v)
            ),
            None => false,
        }
    }

    /// Relaunch the simulator if the probe fails. Returns whether a restart
    /// happened.
    pub fn restart_if_dead(&mut self) -> SgResult<bool> {
        if self.health_check() {
            return Ok(false);
        }

        tracing::warn!(
            worker_id = self.worker_id,
            pid = ?self.pid(),
            "Simulator is not responding; restarting"
        );
        self.release();
        self.launch()?;
        self.restarts += 1;
        Ok(true)
    }

    /// Forward one operation, tagging failures with `stage`.
    pub fn invoke(&mut self, stage: &str, operation: &str, args: &[Value]) -> SgResult<Value> {
        let backend = self.backend.as_mut().ok_or(ComputeError::NotRunning)?;
        backend.call(operation, args).map_err(|message| {
            ComputeError::Call {
                stage: stage.to_string(),
                operation: operation.to_string(),
                message,
            }
            .into()
        })
    }

    /// [`invoke`](Self::invoke) and deserialize the result.
    pub fn invoke_as<T: DeserializeOwned>(
        &mut self,
        stage: &str,
        operation: &str,
        args: &[Value],
    ) -> SgResult<T> {
        let value = self.invoke(stage, operation, args)?;
        serde_json::from_value(value).map_err(|e| {
            ComputeError::UnexpectedResult {
                stage: stage.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Release the simulator.
    pub fn shutdown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            tracing::debug!(worker_id = self.worker_id, pid = ?backend.pid(), "Stopping simulator");
            backend.terminate();
        }
    }
}

impl Drop for ExternalComputeSession {
    fn drop(&mut self) {
        self.release();
    }
}
