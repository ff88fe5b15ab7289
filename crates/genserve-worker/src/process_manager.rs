//! Worker process launching.
//!
//! Workers are the same binary started with the `worker` subcommand unless
//! the launch config names another program. Each spawn yields a fresh
//! process; the scheduler never reuses one after teardown.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use genserve_config::WorkerLaunchConfig;
use genserve_types::{GenError, Result};
use log::info;

use super::worker_bridge::WorkerBridge;

/// Builds worker child processes.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessManager {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Use the configured program, or the running executable.
    pub fn from_config(config: &WorkerLaunchConfig) -> Result<Self> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| GenError::Config(format!("cannot find own executable: {e}")))?,
        };
        Ok(Self::new(program, config.args.clone()))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Start a worker and attach a bridge to its pipes.
    pub fn spawn_worker(&self) -> Result<WorkerBridge> {
        let child = self.spawn_child()?;
        WorkerBridge::attach(child)
    }

    fn spawn_child(&self) -> Result<Child> {
        info!(
            "[PROCESS_MGR] spawning worker: {} {}",
            self.program.display(),
            self.args.join(" ")
        );
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // worker logs go to the parent's stderr
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                GenError::Load(format!(
                    "failed to spawn worker {}: {e}",
                    self.program.display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_the_running_executable() {
        let manager = ProcessManager::from_config(&WorkerLaunchConfig::default()).unwrap();
        assert_eq!(manager.program(), &std::env::current_exe().unwrap());
        assert_eq!(manager.args, ["worker"]);
    }

    #[test]
    fn missing_program_is_a_load_error() {
        let manager = ProcessManager::new("/nonexistent/genserve-worker", Vec::new());
        let err = manager.spawn_worker().err().unwrap();
        assert!(matches!(err, GenError::Load(_)));
    }
}
