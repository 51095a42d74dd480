//! In-process simulator backend.
//!
//! Wraps a Rust closure so generators can run without an external program
//! (dry runs, tests). The probe and path operations are answered natively.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use sg_types::{internal_error, SessionConfig, SgResult};

use crate::backend::{BackendType, SimulatorBackend, SimulatorLauncher, ADD_PATH_OP, HEALTH_PROBE_OP};

/// Outcome of a failing local call.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalFault {
    /// The call failed; the instance stays alive.
    Error(String),
    /// The call failed and took the instance down with it.
    Crash(String),
}

impl From<String> for LocalFault {
    fn from(message: String) -> Self {
        LocalFault::Error(message)
    }
}

impl From<&str> for LocalFault {
    fn from(message: &str) -> Self {
        LocalFault::Error(message.to_string())
    }
}

type Handler = dyn Fn(usize, &str, &[Value]) -> Result<Value, LocalFault> + Send + Sync;

/// Launches [`LocalBackend`]s sharing one handler.
#[derive(Clone)]
pub struct LocalLauncher {
    handler: Arc<Handler>,
    failed_launches: Arc<AtomicUsize>,
    launches: Arc<Mutex<Vec<usize>>>,
}

impl std::fmt::Debug for LocalLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLauncher")
            .field("launches", &self.launches.lock().len())
            .finish()
    }
}

impl LocalLauncher {
    /// `handler(worker_id, operation, args)` serves every operation except
    /// the liveness probe and `addpath`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(usize, &str, &[Value]) -> Result<Value, LocalFault> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            failed_launches: Arc::new(AtomicUsize::new(0)),
            launches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make the next `count` launches fail.
    pub fn with_failed_launches(self, count: usize) -> Self {
        self.failed_launches.store(count, Ordering::SeqCst);
        self
    }

    /// Worker ids of every successful launch, in launch order.
    pub fn launches(&self) -> Vec<usize> {
        self.launches.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }
}

impl SimulatorLauncher for LocalLauncher {
    fn launch(&self, worker_id: usize, _config: &SessionConfig) -> SgResult<Box<dyn SimulatorBackend>> {
        let should_fail = self
            .failed_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(internal_error!("local simulator for worker {} refused to start", worker_id));
        }

        self.launches.lock().push(worker_id);
        Ok(Box::new(LocalBackend {
            worker_id,
            handler: Arc::clone(&self.handler),
            alive: true,
        }))
    }
}

/// A simulator instance backed by a closure.
pub struct LocalBackend {
    worker_id: usize,
    handler: Arc<Handler>,
    alive: bool,
}

impl SimulatorBackend for LocalBackend {
    fn call(&mut self, operation: &str, args: &[Value]) -> Result<Value, String> {
        if !self.alive {
            return Err("simulator instance is not running".to_string());
        }

        match operation {
            HEALTH_PROBE_OP => {
                let base = args.first().and_then(Value::as_f64).unwrap_or(f64::NAN);
                let exp = args.get(1).and_then(Value::as_f64).unwrap_or(f64::NAN);
                Ok(Value::from(base.powf(exp)))
            }
            ADD_PATH_OP => Ok(Value::Null),
            _ => match (self.handler)(self.worker_id, operation, args) {
                Ok(value) => Ok(value),
                Err(LocalFault::Error(message)) => Err(message),
                Err(LocalFault::Crash(message)) => {
                    self.alive = false;
                    Err(message)
                }
            },
        }
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&mut self) {
        self.alive = false;
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{health_probe_args, is_healthy_probe_result};

    #[test]
    fn test_probe_and_handler() {
        let launcher = LocalLauncher::new(|worker, op, args| match op {
            "add" => Ok(Value::from(args[0].as_f64().unwrap() + worker as f64)),
            _ => Err(format!("unknown operation {op}").into()),
        });

        let mut backend = launcher.launch(3, &SessionConfig::default()).unwrap();
        assert_eq!(backend.backend_type(), BackendType::Local);
        assert!(is_healthy_probe_result(&backend.call(HEALTH_PROBE_OP, &health_probe_args()).unwrap()));
        assert_eq!(backend.call("add", &[Value::from(1.0)]).unwrap(), Value::from(4.0));
        assert!(backend.call("missing", &[]).is_err());
        assert_eq!(launcher.launches(), vec![3]);
    }

    #[test]
    fn test_crash_kills_instance() {
        let launcher = LocalLauncher::new(|_, _, _| Err(LocalFault::Crash("segfault".into())));
        let mut backend = launcher.launch(0, &SessionConfig::default()).unwrap();

        assert_eq!(backend.call("anything", &[]), Err("segfault".to_string()));
        assert!(backend.call(HEALTH_PROBE_OP, &health_probe_args()).is_err());
    }

    #[test]
    fn test_failed_launches() {
        let launcher = LocalLauncher::new(|_, _, _| Ok(Value::Null)).with_failed_launches(2);
        let config = SessionConfig::default();
        assert!(launcher.launch(0, &config).is_err());
        assert!(launcher.launch(0, &config).is_err());
        assert!(launcher.launch(0, &config).is_ok());
        assert_eq!(launcher.launch_count(), 1);
    }
}
