//! Out-of-process simulator backend.
//!
//! The simulator program reads one JSON request per line on stdin,
//! `{"id": 1, "op": "name", "args": [...]}`, and answers with one line on
//! stdout, either `{"id": 1, "ok": <value>}` or `{"id": 1, "error": "..."}`.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sg_types::{ComputeError, SessionConfig, SgResult};

use crate::backend::{BackendType, SimulatorBackend, SimulatorLauncher, ADD_PATH_OP};

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    op: &'a str,
    args: &'a [Value],
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    ok: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Spawns the configured simulator program once per worker.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    fn log_file(worker_id: usize, config: &SessionConfig) -> Stdio {
        let Some(dir) = &config.log_dir else {
            return Stdio::null();
        };
        let path = dir.join(format!("simulator.worker-{worker_id}.log"));
        match std::fs::create_dir_all(dir).and_then(|_| File::create(&path)) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                tracing::warn!("Unable to create simulator log {}: {}", path.display(), e);
                Stdio::null()
            }
        }
    }

    /// Pin the process to one CPU. Best effort.
    fn set_affinity(pid: u32, worker_id: usize) {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let cpu = worker_id % cpus;
        let status = Command::new("taskset")
            .args(["-p", "-c", &cpu.to_string(), &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => tracing::debug!("Pinned simulator {} to CPU {}", pid, cpu),
            Ok(s) => tracing::warn!("taskset exited with {} for simulator {}", s, pid),
            Err(e) => tracing::warn!("Unable to set affinity for simulator {}: {}", pid, e),
        }
    }

    /// Adjust the process niceness. Best effort.
    fn set_priority(pid: u32, niceness: i32) {
        if niceness == 0 {
            return;
        }
        let status = Command::new("renice")
            .args(["-n", &niceness.to_string(), "-p", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => tracing::debug!("Set simulator {} niceness to {}", pid, niceness),
            Ok(s) => tracing::warn!("renice exited with {} for simulator {}", s, pid),
            Err(e) => tracing::warn!("Unable to set priority for simulator {}: {}", pid, e),
        }
    }
}

impl SimulatorLauncher for ProcessLauncher {
    fn launch(&self, worker_id: usize, config: &SessionConfig) -> SgResult<Box<dyn SimulatorBackend>> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Self::log_file(worker_id, config));
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        tracing::debug!("Spawned simulator {} for worker {}", pid, worker_id);

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ComputeError::Protocol {
                    message: "simulator pipes unavailable".to_string(),
                }
                .into());
            }
        };

        let mut backend = ProcessBackend {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
        };

        if config.set_affinity {
            Self::set_affinity(pid, worker_id);
        }
        Self::set_priority(pid, config.priority.niceness());

        for path in &config.script_paths {
            let arg = Value::from(path.to_string_lossy().into_owned());
            if let Err(message) = backend.call(ADD_PATH_OP, std::slice::from_ref(&arg)) {
                backend.terminate();
                return Err(ComputeError::Call {
                    stage: "Startup".to_string(),
                    operation: ADD_PATH_OP.to_string(),
                    message,
                }
                .into());
            }
        }

        Ok(Box::new(backend))
    }
}

/// A running simulator child process.
pub struct ProcessBackend {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl SimulatorBackend for ProcessBackend {
    fn call(&mut self, operation: &str, args: &[Value]) -> Result<Value, String> {
        self.next_id += 1;
        let request = Request { id: self.next_id, op: operation, args };
        let line = serde_json::to_string(&request).map_err(|e| e.to_string())?;

        writeln!(self.stdin, "{line}").map_err(|e| format!("write to simulator failed: {e}"))?;
        self.stdin.flush().map_err(|e| format!("write to simulator failed: {e}"))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .map_err(|e| format!("read from simulator failed: {e}"))?;
        if read == 0 {
            return Err("simulator process exited".to_string());
        }

        let response: Response =
            serde_json::from_str(reply.trim()).map_err(|e| format!("malformed simulator reply: {e}"))?;
        if response.id != request.id {
            return Err(format!(
                "simulator replied to request {} while {} was pending",
                response.id, request.id
            ));
        }

        match (response.ok, response.error) {
            (_, Some(error)) => Err(error),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(Value::Null),
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn terminate(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!("Simulator {} already gone: {}", self.child.id(), e);
        }
        let _ = self.child.wait();
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Process
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{health_probe_args, is_healthy_probe_result, HEALTH_PROBE_OP};
    use std::path::PathBuf;

    /// A shell simulator answering every request with 4 (the probe result).
    fn echo_config(script: &str) -> SessionConfig {
        SessionConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            set_affinity: false,
            priority: sg_types::ProcessPriority::Normal,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_line_protocol_roundtrip() {
        let script = r#"i=0; while read line; do i=$((i+1)); echo "{\"id\": $i, \"ok\": 4.0}"; done"#;
        let mut backend = ProcessLauncher::new().launch(0, &echo_config(script)).unwrap();
        assert!(backend.pid().is_some());

        let value = backend.call(HEALTH_PROBE_OP, &health_probe_args()).unwrap();
        assert!(is_healthy_probe_result(&value));
        let value = backend.call(HEALTH_PROBE_OP, &health_probe_args()).unwrap();
        assert!(is_healthy_probe_result(&value));
        backend.terminate();
    }

    #[test]
    fn test_error_reply_and_exit() {
        let script = r#"read line; echo '{"id": 1, "error": "Undefined function"}'"#;
        let mut backend = ProcessLauncher::new().launch(0, &echo_config(script)).unwrap();

        assert_eq!(backend.call("nope", &[]), Err("Undefined function".to_string()));
        assert!(backend.call("nope", &[]).is_err());
    }

    #[test]
    fn test_missing_program_fails() {
        let config = SessionConfig {
            program: PathBuf::from("/nonexistent/simulator"),
            ..SessionConfig::default()
        };
        assert!(ProcessLauncher::new().launch(0, &config).is_err());
    }

    #[test]
    fn test_stderr_goes_to_worker_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = echo_config(r#"echo started >&2; read line; echo '{"id": 1, "ok": null}'"#);
        config.log_dir = Some(dir.path().to_path_buf());

        let mut backend = ProcessLauncher::new().launch(2, &config).unwrap();
        assert_eq!(backend.call("noop", &[]), Ok(Value::Null));
        backend.terminate();

        let log = std::fs::read_to_string(dir.path().join("simulator.worker-2.log")).unwrap();
        assert!(log.contains("started"));
    }
}
