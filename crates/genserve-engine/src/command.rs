//! External pipeline runner backend.
//!
//! The runner (for example a diffusers script) is a child of the worker
//! process and speaks one JSON object per line on stdin/stdout:
//!
//! ```text
//! -> {"op":"load","task_type":"text2img","params":{...},"placement":"accelerator","loras":[...]}
//! <- {"ok":true}
//! -> {"op":"run","params":{...}}
//! <- {"ok":true,"result":{"image_path":"..."}}
//! -> {"op":"unload_loras"} / {"op":"load_loras","loras":[...]}
//! -> {"op":"shutdown"}
//! ```
//!
//! Any `{"ok":false,"error":"..."}` reply fails the request.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use genserve_types::{LoraSignature, ModelLoraConfig, Params, TaskType};
use log::{info, warn};
use serde_json::{json, Value};

use crate::{Engine, EngineError, EngineFactory, LoadRequest};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct CommandEngineFactory;

impl EngineFactory for CommandEngineFactory {
    fn backend(&self) -> &'static str {
        "command"
    }

    fn load(&self, request: &LoadRequest) -> Result<Box<dyn Engine>, EngineError> {
        let argv: Vec<String> = match request.params.get("command") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(EngineError::Load(format!(
                "no runner command configured for {}",
                request.task_type
            )));
        };

        let mut engine = CommandEngine::spawn(request.task_type, program, args)?;
        let flat = request.flat_loras();
        // a failed handshake drops `engine`, which kills the runner
        engine.call(json!({
            "op": "load",
            "task_type": request.task_type,
            "params": request.params,
            "placement": request.placement.as_str(),
            "loras": flat,
        }))
        .map_err(EngineError::Load)?;
        engine.attached = flat;
        info!(
            "[ENGINE] runner {program} ready for {} (pid {})",
            request.task_type,
            engine.child.id()
        );
        Ok(Box::new(engine))
    }
}

pub struct CommandEngine {
    task_type: TaskType,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    attached: Vec<ModelLoraConfig>,
}

impl CommandEngine {
    fn spawn(task_type: TaskType, program: &str, args: &[String]) -> Result<Self, EngineError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        die_with_parent(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Load(format!("failed to spawn runner {program}: {e}")))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Load("runner stdio was not captured".into()));
        };

        Ok(Self {
            task_type,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            attached: Vec::new(),
        })
    }

    /// One request/reply exchange. Errors are plain messages so callers
    /// pick the error kind.
    fn call(&mut self, request: Value) -> Result<Value, String> {
        let line = serde_json::to_string(&request).map_err(|e| e.to_string())?;
        writeln!(self.stdin, "{line}")
            .and_then(|_| self.stdin.flush())
            .map_err(|e| format!("runner stdin closed: {e}"))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .map_err(|e| format!("failed to read runner reply: {e}"))?;
        if read == 0 {
            return Err("runner exited without replying".to_string());
        }

        let reply: Value = serde_json::from_str(reply.trim())
            .map_err(|e| format!("malformed runner reply: {e}"))?;
        if reply.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(reply.get("result").cloned().unwrap_or(Value::Null))
        } else {
            Err(reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("runner reported an unspecified error")
                .to_string())
        }
    }

    fn reap(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        warn!("[ENGINE] runner did not exit in time, killing it");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Engine for CommandEngine {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn run(&mut self, params: &Params) -> Result<Value, EngineError> {
        self.call(json!({"op": "run", "params": params}))
            .map_err(EngineError::Inference)
    }

    fn attach_loras(&mut self, loras: &[ModelLoraConfig]) -> Result<(), EngineError> {
        self.call(json!({"op": "load_loras", "loras": loras}))
            .map_err(EngineError::Inference)?;
        self.attached.extend_from_slice(loras);
        Ok(())
    }

    fn detach_loras(&mut self) -> Result<(), EngineError> {
        self.call(json!({"op": "unload_loras"}))
            .map_err(EngineError::Inference)?;
        self.attached.clear();
        Ok(())
    }

    fn attached_loras(&self) -> LoraSignature {
        LoraSignature::from_flat(&self.attached)
    }

    fn unload(&mut self) -> Result<(), EngineError> {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        if let Err(e) = self.call(json!({"op": "shutdown"})) {
            warn!("[ENGINE] runner shutdown request failed: {e}");
        }
        self.reap();
        Ok(())
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Have the kernel kill the runner if the worker process dies first.
#[cfg(target_os = "linux")]
fn die_with_parent(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: prctl is async-signal-safe and touches no parent memory.
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_command: &mut Command) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::Placement;

    fn request(command: Value) -> LoadRequest {
        let mut params = Params::new();
        params.insert("command".into(), command);
        LoadRequest {
            task_type: TaskType::Text2Video,
            params,
            loras: Vec::new(),
            placement: Placement::Cpu,
        }
    }

    /// A shell runner that acknowledges every line and echoes a result.
    const ECHO_RUNNER: &str = r#"while read -r line; do
        case "$line" in
          *'"op":"shutdown"'*) echo '{"ok":true}'; exit 0 ;;
          *'"op":"run"'*) echo '{"ok":true,"result":{"video_path":"/files/out.mp4"}}' ;;
          *) echo '{"ok":true}' ;;
        esac
      done"#;

    #[test]
    fn missing_command_is_a_load_error() {
        let err = CommandEngineFactory
            .load(&request(Value::Null))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Load(_)));
    }

    #[test]
    fn runner_that_exits_fails_the_load() {
        let err = CommandEngineFactory
            .load(&request(json!(["true"])))
            .err()
            .unwrap();
        assert!(err.to_string().contains("exited") || err.to_string().contains("closed"));
    }

    #[test]
    fn runner_error_reply_fails_the_load() {
        let err = CommandEngineFactory
            .load(&request(json!([
                "sh", "-c", r#"read -r line; echo '{"ok":false,"error":"CUDA out of memory"}'"#
            ])))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "CUDA out of memory");
    }

    #[test]
    fn runs_and_shuts_down_an_echo_runner() {
        let mut engine = CommandEngineFactory
            .load(&request(json!(["sh", "-c", ECHO_RUNNER])))
            .unwrap();
        let result = engine.run(&Params::new()).unwrap();
        assert_eq!(result["video_path"], "/files/out.mp4");

        let lora = ModelLoraConfig {
            name: None,
            path: "/loras/a.safetensors".into(),
            strength: None,
        };
        engine.attach_loras(std::slice::from_ref(&lora)).unwrap();
        assert_eq!(engine.attached_loras().entries().len(), 1);
        engine.detach_loras().unwrap();
        assert!(engine.attached_loras().is_empty());
        engine.unload().unwrap();
    }
}
