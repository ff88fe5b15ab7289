//! Worker process entry point.
//!
//! Runs as a child process spawned by the scheduler. Reads framed commands
//! from stdin, drives at most one engine, and writes exactly one framed
//! reply per `load`/`run`/`unload` to stdout. All log output goes to stderr
//! (inherited by the parent).
//!
//! States: Idle → Loading → Loaded ⇄ Running, Loaded → Unloading → Idle.
//! A failed load returns to Idle; a failed unload ends the process.

use std::io::{self, Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

use genserve_engine::memory::reclaim_host_memory;
use genserve_engine::{lora_configs, Engine, EngineError, EngineRegistry, LoadRequest};
use genserve_types::{flatten_loras, LoraSignature, Params, TaskType};
use log::{error, info, warn};
use serde_json::json;

use super::framing::{read_frame, write_frame};
use super::ipc_types::{MessageKind, WorkerMessage};

/// Why the serve loop ended.
#[derive(Debug, PartialEq)]
pub enum WorkerExit {
    /// `exit` command received.
    Requested,
    /// stdin closed: the scheduler went away.
    ParentGone,
    /// Protocol or engine failure the process cannot recover from.
    Fatal(String),
}

impl WorkerExit {
    pub fn code(&self) -> i32 {
        match self {
            WorkerExit::Requested | WorkerExit::ParentGone => 0,
            WorkerExit::Fatal(_) => 1,
        }
    }
}

/// Run the worker process over stdin/stdout. Returns the exit code.
pub fn run_worker() -> i32 {
    info!("[WORKER] starting generation worker (pid={})", std::process::id());
    let registry = EngineRegistry::default();
    let exit = serve(io::stdin().lock(), io::stdout().lock(), &registry);
    match &exit {
        WorkerExit::Fatal(reason) => error!("[WORKER] exiting after fatal error: {reason}"),
        other => info!("[WORKER] exiting ({other:?})"),
    }
    exit.code()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    Loading,
    Loaded,
    Running,
    Unloading,
}

enum Step {
    Reply(WorkerMessage),
    /// Send the reply, then terminate with the given reason.
    ReplyAndExit(WorkerMessage, String),
    Exit,
}

struct Worker<'a> {
    registry: &'a EngineRegistry,
    engine: Option<Box<dyn Engine>>,
    phase: Phase,
}

/// Serve framed commands from `input` until exit, end of input or a fatal
/// error.
pub fn serve<R: Read, W: Write>(mut input: R, mut output: W, registry: &EngineRegistry) -> WorkerExit {
    let mut worker = Worker {
        registry,
        engine: None,
        phase: Phase::Idle,
    };

    let exit = loop {
        let message = match read_frame(&mut input) {
            Ok(Some(message)) => message,
            Ok(None) => break WorkerExit::ParentGone,
            Err(e) => {
                let _ = write_frame(&mut output, &WorkerMessage::error(format!("malformed frame: {e}")));
                break WorkerExit::Fatal(format!("malformed frame: {e}"));
            }
        };

        match worker.handle(message) {
            Step::Reply(reply) => {
                if let Err(e) = write_frame(&mut output, &reply) {
                    break WorkerExit::Fatal(format!("failed to write reply: {e}"));
                }
            }
            Step::ReplyAndExit(reply, reason) => {
                let _ = write_frame(&mut output, &reply);
                break WorkerExit::Fatal(reason);
            }
            Step::Exit => break WorkerExit::Requested,
        }
    };

    worker.release();
    exit
}

impl Worker<'_> {
    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            log::debug!("[WORKER] {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn handle(&mut self, message: WorkerMessage) -> Step {
        match message.kind {
            MessageKind::Load => match message.task_type {
                Some(task_type) => Step::Reply(self.load(task_type, message.params.unwrap_or_default())),
                None => Step::Reply(WorkerMessage::error("load requires a task_type")),
            },
            MessageKind::Run => Step::Reply(self.run(message.params.unwrap_or_default())),
            MessageKind::Unload => self.unload(),
            MessageKind::Exit => {
                info!("[WORKER] exit requested");
                Step::Exit
            }
            other => Step::Reply(WorkerMessage::error(format!(
                "unexpected {other:?} message sent to worker"
            ))),
        }
    }

    fn load(&mut self, task_type: TaskType, params: Params) -> WorkerMessage {
        if self.engine.is_some() {
            warn!("[WORKER] load while a model is resident; releasing it first");
            self.release();
        }
        self.set_phase(Phase::Loading);

        let request = match LoadRequest::from_params(task_type, params) {
            Ok(request) => request,
            Err(e) => {
                self.set_phase(Phase::Idle);
                return WorkerMessage::error(e.to_string());
            }
        };

        info!("[WORKER] loading {task_type} engine");
        let registry = self.registry;
        match guarded(|| registry.load(&request)) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.set_phase(Phase::Loaded);
                info!("[WORKER] {task_type} engine loaded ({})", request.placement.as_str());
                WorkerMessage::result(json!({
                    "status": "loaded",
                    "task_type": task_type,
                    "placement": request.placement.as_str(),
                }))
            }
            Err(e) => {
                error!("[WORKER] failed to load {task_type} engine: {e}");
                reclaim_host_memory();
                self.set_phase(Phase::Idle);
                WorkerMessage::error(e.to_string())
            }
        }
    }

    fn run(&mut self, params: Params) -> WorkerMessage {
        let Some(mut engine) = self.engine.take() else {
            return WorkerMessage::error("no model loaded; send load first");
        };
        self.set_phase(Phase::Running);

        let outcome = sync_loras(engine.as_mut(), &params)
            .and_then(|()| guarded(|| engine.run(&params)));

        self.engine = Some(engine);
        self.set_phase(Phase::Loaded);
        match outcome {
            Ok(result) => WorkerMessage::result(result),
            Err(e) => {
                error!("[WORKER] generation failed: {e}");
                reclaim_host_memory();
                WorkerMessage::error(e.to_string())
            }
        }
    }

    fn unload(&mut self) -> Step {
        let Some(mut engine) = self.engine.take() else {
            return Step::Reply(WorkerMessage::result(json!({"status": "idle"})));
        };
        self.set_phase(Phase::Unloading);
        let task_type = engine.task_type();

        match guarded(|| engine.unload()) {
            Ok(()) => {
                drop(engine);
                reclaim_host_memory();
                self.set_phase(Phase::Idle);
                info!("[WORKER] {task_type} engine unloaded");
                Step::Reply(WorkerMessage::result(json!({"status": "success"})))
            }
            Err(e) => {
                drop(engine);
                Step::ReplyAndExit(
                    WorkerMessage::error(format!("unload failed: {e}")),
                    format!("unload of {task_type} engine failed: {e}"),
                )
            }
        }
    }

    /// Best-effort teardown of whatever is resident.
    fn release(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = guarded(|| engine.unload()) {
                warn!("[WORKER] engine unload during release failed: {e}");
            }
            drop(engine);
            reclaim_host_memory();
        }
        self.set_phase(Phase::Idle);
    }
}

/// Swap adapters when the run asks for a different set than is attached.
/// Runs without `lora_configs` keep the current set.
fn sync_loras(engine: &mut dyn Engine, params: &Params) -> Result<(), EngineError> {
    if !params.contains_key("lora_configs") {
        return Ok(());
    }
    let wanted = flatten_loras(&lora_configs(params)?);
    if LoraSignature::from_flat(&wanted) == engine.attached_loras() {
        return Ok(());
    }
    if !engine.attached_loras().is_empty() {
        info!("[WORKER] detaching previous LoRA set");
        guarded(|| engine.detach_loras())?;
    }
    if !wanted.is_empty() {
        info!("[WORKER] attaching {} LoRA file(s)", wanted.len());
        guarded(|| engine.attach_loras(&wanted))?;
    }
    Ok(())
}

/// Run an engine call, turning a panic into an inference error.
fn guarded<T>(f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!("[WORKER] engine panicked: {msg}");
            Err(EngineError::Inference(format!("engine panicked: {msg}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{read_frame, write_frame};
    use genserve_engine::EngineFactory;
    use genserve_types::LoraConfig;
    use serde_json::Value;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Records every engine call so tests can check ordering.
    #[derive(Default, Clone)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeFactory {
        journal: Journal,
    }

    struct FakeEngine {
        task_type: TaskType,
        journal: Journal,
        attached: Vec<genserve_types::ModelLoraConfig>,
        fail_unload: bool,
    }

    impl EngineFactory for FakeFactory {
        fn backend(&self) -> &'static str {
            "fake"
        }
        fn load(&self, request: &LoadRequest) -> Result<Box<dyn Engine>, EngineError> {
            if request.params.contains_key("fail_load") {
                self.journal.push("load-failed");
                return Err(EngineError::Load("weights missing".into()));
            }
            if request.params.contains_key("panic_load") {
                panic!("loader exploded");
            }
            self.journal.push(format!("load:{}", request.task_type));
            Ok(Box::new(FakeEngine {
                task_type: request.task_type,
                journal: self.journal.clone(),
                attached: request.flat_loras(),
                fail_unload: request.params.contains_key("fail_unload"),
            }))
        }
    }

    impl Engine for FakeEngine {
        fn task_type(&self) -> TaskType {
            self.task_type
        }
        fn run(&mut self, params: &Params) -> Result<Value, EngineError> {
            if params.contains_key("fail_run") {
                return Err(EngineError::Inference("out of memory".into()));
            }
            self.journal.push("run");
            Ok(json!({"image_path": "/files/out.png"}))
        }
        fn attach_loras(&mut self, loras: &[genserve_types::ModelLoraConfig]) -> Result<(), EngineError> {
            self.journal.push(format!("attach:{}", loras.len()));
            self.attached.extend_from_slice(loras);
            Ok(())
        }
        fn detach_loras(&mut self) -> Result<(), EngineError> {
            self.journal.push("detach");
            self.attached.clear();
            Ok(())
        }
        fn attached_loras(&self) -> LoraSignature {
            LoraSignature::from_flat(&self.attached)
        }
        fn unload(&mut self) -> Result<(), EngineError> {
            self.journal.push("unload");
            if self.fail_unload {
                return Err(EngineError::Inference("device busy".into()));
            }
            Ok(())
        }
    }

    fn registry(journal: &Journal) -> EngineRegistry {
        let mut registry = EngineRegistry::empty();
        registry.register(Box::new(FakeFactory {
            journal: journal.clone(),
        }));
        registry
    }

    fn load_params(extra: &[&str]) -> Params {
        let mut params = Params::new();
        params.insert("backend".into(), json!("fake"));
        for key in extra {
            params.insert((*key).into(), json!(true));
        }
        params
    }

    fn lora_params(path: &str) -> Params {
        let mut params = Params::new();
        params.insert(
            "lora_configs".into(),
            serde_json::to_value(vec![LoraConfig {
                id: Some(1),
                path: Some(path.into()),
                ..Default::default()
            }])
            .unwrap(),
        );
        params
    }

    /// Feed `messages` through `serve` and collect the replies.
    fn drive(journal: &Journal, messages: &[WorkerMessage]) -> (Vec<WorkerMessage>, WorkerExit) {
        let mut input = Vec::new();
        for message in messages {
            write_frame(&mut input, message).unwrap();
        }
        let mut output = Vec::new();
        let exit = serve(Cursor::new(input), &mut output, &registry(journal));

        let mut replies = Vec::new();
        let mut cursor = Cursor::new(output);
        while let Some(reply) = read_frame(&mut cursor).unwrap() {
            replies.push(reply);
        }
        (replies, exit)
    }

    #[test]
    fn load_run_unload_exit() {
        let journal = Journal::default();
        let (replies, exit) = drive(
            &journal,
            &[
                WorkerMessage::load(TaskType::Text2Img, load_params(&[])),
                WorkerMessage::run(Params::new()),
                WorkerMessage::unload(),
                WorkerMessage::exit(),
            ],
        );
        assert_eq!(exit, WorkerExit::Requested);
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|r| r.kind == MessageKind::Result));
        assert_eq!(replies[1].result.as_ref().unwrap()["image_path"], "/files/out.png");
        assert_eq!(replies[2].result.as_ref().unwrap()["status"], "success");
        assert_eq!(journal.entries(), ["load:text2img", "run", "unload"]);
    }

    #[test]
    fn run_before_load_is_an_error() {
        let journal = Journal::default();
        let (replies, exit) = drive(&journal, &[WorkerMessage::run(Params::new())]);
        assert_eq!(exit, WorkerExit::ParentGone);
        assert_eq!(replies[0].kind, MessageKind::Error);
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn failed_load_returns_to_idle() {
        let journal = Journal::default();
        let (replies, _) = drive(
            &journal,
            &[
                WorkerMessage::load(TaskType::Text2Img, load_params(&["fail_load"])),
                WorkerMessage::run(Params::new()),
                WorkerMessage::load(TaskType::Text2Img, load_params(&[])),
                WorkerMessage::run(Params::new()),
            ],
        );
        let kinds: Vec<_> = replies.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [MessageKind::Error, MessageKind::Error, MessageKind::Result, MessageKind::Result]
        );
        assert_eq!(replies[0].error.as_deref(), Some("weights missing"));
    }

    #[test]
    fn loader_panic_becomes_an_error_reply() {
        let journal = Journal::default();
        let (replies, exit) = drive(
            &journal,
            &[WorkerMessage::load(TaskType::Text2Img, load_params(&["panic_load"]))],
        );
        assert_eq!(exit, WorkerExit::ParentGone);
        assert!(replies[0].error.as_ref().unwrap().contains("loader exploded"));
    }

    #[test]
    fn run_failure_keeps_the_engine_loaded() {
        let journal = Journal::default();
        let mut fail = Params::new();
        fail.insert("fail_run".into(), json!(true));
        let (replies, _) = drive(
            &journal,
            &[
                WorkerMessage::load(TaskType::Text2Video, load_params(&[])),
                WorkerMessage::run(fail),
                WorkerMessage::run(Params::new()),
            ],
        );
        assert_eq!(replies[1].error.as_deref(), Some("out of memory"));
        assert_eq!(replies[2].kind, MessageKind::Result);
    }

    #[test]
    fn changed_loras_are_detached_before_attaching() {
        let journal = Journal::default();
        let mut load = load_params(&[]);
        load.extend(lora_params("/loras/a.safetensors"));
        let (_, _) = drive(
            &journal,
            &[
                WorkerMessage::load(TaskType::Text2Img, load),
                // same set: no swap
                WorkerMessage::run(lora_params("/loras/a.safetensors")),
                // different set: detach then attach
                WorkerMessage::run(lora_params("/loras/b.safetensors")),
            ],
        );
        assert_eq!(
            journal.entries(),
            ["load:text2img", "run", "detach", "attach:1", "run"]
        );
    }

    #[test]
    fn unload_without_model_is_idempotent() {
        let journal = Journal::default();
        let (replies, _) = drive(&journal, &[WorkerMessage::unload(), WorkerMessage::unload()]);
        assert!(replies.iter().all(|r| r.kind == MessageKind::Result));
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn failed_unload_ends_the_process() {
        let journal = Journal::default();
        let (replies, exit) = drive(
            &journal,
            &[
                WorkerMessage::load(TaskType::Img2Img, load_params(&["fail_unload"])),
                WorkerMessage::unload(),
                WorkerMessage::run(Params::new()),
            ],
        );
        assert!(matches!(exit, WorkerExit::Fatal(_)));
        assert_eq!(exit.code(), 1);
        // the run after the failed unload is never read
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].kind, MessageKind::Error);
    }

    #[test]
    fn exit_releases_a_resident_engine() {
        let journal = Journal::default();
        let (replies, exit) = drive(
            &journal,
            &[
                WorkerMessage::load(TaskType::Text2Img, load_params(&[])),
                WorkerMessage::exit(),
            ],
        );
        assert_eq!(exit, WorkerExit::Requested);
        assert_eq!(replies.len(), 1);
        assert_eq!(journal.entries(), ["load:text2img", "unload"]);
    }

    #[test]
    fn reply_kinds_are_rejected_as_commands() {
        let journal = Journal::default();
        let (replies, _) = drive(&journal, &[WorkerMessage::result(json!(1))]);
        assert_eq!(replies[0].kind, MessageKind::Error);
    }

    #[test]
    fn garbage_input_is_fatal() {
        let mut output = Vec::new();
        let exit = serve(
            Cursor::new(vec![0u8, 0, 0, 2, b'{', b'x']),
            &mut output,
            &EngineRegistry::empty(),
        );
        assert!(matches!(exit, WorkerExit::Fatal(_)));
        let reply = read_frame(&mut Cursor::new(output)).unwrap().unwrap();
        assert_eq!(reply.kind, MessageKind::Error);
    }
}
