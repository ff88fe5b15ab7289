//! Single-slot model scheduler.
//!
//! Decides which engine is resident, drives the worker process through
//! load/run/unload, and guarantees the worker is torn down on every
//! failure that leaves its state untrusted. At most one engine is ever
//! loaded: switching task type or LoRA set always unloads first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use genserve_config::SchedulerConfig;
use genserve_engine::memory::{self, reclaim_host_memory, GpuMemory, HostMemory, MemorySnapshot};
use genserve_types::{GenError, LoraConfig, LoraSignature, Params, Result, TaskType};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;

use super::ipc_types::WorkerMessage;
use super::process_manager::ProcessManager;
use super::worker_bridge::WorkerBridge;

/// Timing budgets for worker round trips.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub load_timeout: Duration,
    pub run_timeout: Duration,
    pub unload_timeout: Duration,
    pub exit_timeout: Duration,
    pub kill_timeout: Duration,
    pub max_load_attempts: u32,
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            load_timeout: Duration::from_secs(config.load_timeout_secs),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            unload_timeout: Duration::from_secs(config.unload_timeout_secs),
            exit_timeout: Duration::from_secs(config.exit_timeout_secs),
            kill_timeout: Duration::from_secs(config.kill_timeout_secs),
            max_load_attempts: config.max_load_attempts.max(1),
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// Messages sent and processes started since the scheduler was created.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    loads: AtomicU64,
    runs: AtomicU64,
    unloads: AtomicU64,
    exits: AtomicU64,
    spawned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub loads: u64,
    pub runs: u64,
    pub unloads: u64,
    pub exits: u64,
    pub spawned: u64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            spawned: self.spawned.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of the slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CurrentModel {
    pub task_type: Option<TaskType>,
    pub lora_signature: LoraSignature,
    pub params: Option<Params>,
    pub worker_pid: Option<u32>,
}

impl CurrentModel {
    pub fn is_loaded(&self) -> bool {
        self.task_type.is_some()
    }
}

struct ActiveModel {
    task_type: TaskType,
    signature: LoraSignature,
    params: Params,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveModel>,
    worker: Option<WorkerBridge>,
}

pub struct ModelScheduler {
    launcher: ProcessManager,
    options: SchedulerOptions,
    slot: Mutex<Slot>,
    /// Mirror of the slot for readers that must not wait behind a run.
    current: Mutex<CurrentModel>,
    stats: SchedulerStats,
}

impl ModelScheduler {
    pub fn new(launcher: ProcessManager, options: SchedulerOptions) -> Self {
        Self {
            launcher,
            options,
            slot: Mutex::new(Slot::default()),
            current: Mutex::new(CurrentModel::default()),
            stats: SchedulerStats::default(),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, slot: &Slot) {
        let view = CurrentModel {
            task_type: slot.active.as_ref().map(|a| a.task_type),
            lora_signature: slot
                .active
                .as_ref()
                .map(|a| a.signature.clone())
                .unwrap_or_default(),
            params: slot.active.as_ref().map(|a| a.params.clone()),
            worker_pid: slot.worker.as_ref().map(WorkerBridge::pid),
        };
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = view;
    }

    /// Make `task_type` with `loras` the resident engine and return a
    /// handle that runs generations on it.
    ///
    /// A matching engine on a live worker is reused without any IPC. A
    /// different one is unloaded first. A load that fails because the
    /// worker died is retried on a fresh worker up to `max_load_attempts`
    /// times; every other failure tears the worker down and is returned.
    pub fn load_model(
        &self,
        task_type: TaskType,
        loras: Option<&[LoraConfig]>,
        params: Params,
    ) -> Result<Inference<'_>> {
        let signature = LoraSignature::from_configs(loras);
        let mut slot = self.lock_slot();

        let cached = slot
            .active
            .as_ref()
            .is_some_and(|a| a.task_type == task_type && a.signature == signature);
        if cached {
            if slot.worker.as_mut().is_some_and(WorkerBridge::is_alive) {
                info!("[SCHEDULER] cache hit: {task_type} with LoRA {signature}");
                return Ok(self.inference(task_type, signature));
            }
            warn!("[SCHEDULER] cached {task_type} worker is gone, reloading");
            self.teardown(&mut slot);
        } else if slot.active.is_some() || slot.worker.is_some() {
            info!("[SCHEDULER] switching to {task_type}; unloading resident model first");
            self.unload_locked(&mut slot);
        }

        let mut load_params = params.clone();
        load_params.insert(
            "lora_configs".into(),
            serde_json::to_value(loras.unwrap_or_default())?,
        );

        let attempts = self.options.max_load_attempts;
        for attempt in 1..=attempts {
            match self.try_load(&mut slot, task_type, &load_params) {
                Ok(reply) => {
                    info!(
                        "[SCHEDULER] {task_type} loaded with LoRA {signature} ({})",
                        reply.get("placement").and_then(Value::as_str).unwrap_or("unknown placement")
                    );
                    slot.active = Some(ActiveModel {
                        task_type,
                        signature: signature.clone(),
                        params,
                    });
                    self.publish(&slot);
                    return Ok(self.inference(task_type, signature));
                }
                Err(e @ GenError::ProcessCrash(_)) if attempt < attempts => {
                    warn!("[SCHEDULER] load attempt {attempt}/{attempts} lost its worker: {e}; retrying");
                    self.teardown(&mut slot);
                }
                Err(e) => {
                    error!("[SCHEDULER] failed to load {task_type}: {e}");
                    self.teardown(&mut slot);
                    return Err(e);
                }
            }
        }
        // attempts >= 1, so the loop always returns
        Err(GenError::Load(format!("could not load {task_type}")))
    }

    fn inference(&self, task_type: TaskType, signature: LoraSignature) -> Inference<'_> {
        Inference {
            scheduler: self,
            task_type,
            signature,
        }
    }

    fn try_load(&self, slot: &mut Slot, task_type: TaskType, params: &Params) -> Result<Value> {
        if slot.worker.as_mut().is_some_and(|w| !w.is_alive()) {
            debug!("[SCHEDULER] reaping dead worker before load");
            self.teardown(slot);
        }
        let worker = match slot.worker.take() {
            Some(worker) => worker,
            None => {
                let worker = self.launcher.spawn_worker()?;
                SchedulerStats::bump(&self.stats.spawned);
                info!("[SCHEDULER] worker {} started", worker.pid());
                worker
            }
        };
        let worker = slot.worker.insert(worker);

        SchedulerStats::bump(&self.stats.loads);
        let started = Instant::now();
        let reply = worker.request(
            &WorkerMessage::load(task_type, params.clone()),
            self.options.load_timeout,
        )?;
        let result = reply.into_reply().map_err(GenError::Load)?;
        debug!(
            "[SCHEDULER] load of {task_type} took {:.1}s",
            started.elapsed().as_secs_f64()
        );
        Ok(result)
    }

    fn run(&self, task_type: TaskType, signature: &LoraSignature, params: &Params) -> Result<Value> {
        let mut slot = self.lock_slot();
        let matches = slot
            .active
            .as_ref()
            .is_some_and(|a| a.task_type == task_type && &a.signature == signature);
        if !matches {
            return Err(GenError::Inference(format!(
                "{task_type} is no longer the loaded model"
            )));
        }
        let Some(worker) = slot.worker.as_mut() else {
            return Err(GenError::ProcessCrash("no worker process for the loaded model".into()));
        };

        SchedulerStats::bump(&self.stats.runs);
        let started = Instant::now();
        match worker.request(&WorkerMessage::run(params.clone()), self.options.run_timeout) {
            Ok(reply) => {
                let result = reply.into_reply().map_err(GenError::Inference)?;
                info!(
                    "[SCHEDULER] {task_type} run finished in {:.1}s",
                    started.elapsed().as_secs_f64()
                );
                Ok(result)
            }
            Err(e) => {
                // no reply: the worker's state is unknown
                error!("[SCHEDULER] {task_type} run lost its worker: {e}");
                self.teardown(&mut slot);
                Err(e)
            }
        }
    }

    /// Unload the resident model and end its worker process. No-op when
    /// nothing is loaded.
    pub fn unload_model(&self) {
        let mut slot = self.lock_slot();
        self.unload_locked(&mut slot);
    }

    fn unload_locked(&self, slot: &mut Slot) {
        if slot.active.is_none() && slot.worker.is_none() {
            return;
        }
        let label = slot
            .active
            .as_ref()
            .map(|a| a.task_type.to_string())
            .unwrap_or_else(|| "idle worker".to_string());
        let before = MemorySnapshot::capture();
        info!("[SCHEDULER] unloading {label}; before: {}", before.summary());

        if let Some(mut worker) = slot.worker.take() {
            self.stop_worker(&mut worker);
        }
        slot.active = None;
        self.publish(slot);
        reclaim_host_memory();

        let after = MemorySnapshot::capture();
        info!(
            "[SCHEDULER] unloaded {label}; after: {} (released {})",
            after.summary(),
            before.released_since(&after)
        );
    }

    /// Graceful unload and exit with bounded waits, then escalate.
    fn stop_worker(&self, worker: &mut WorkerBridge) {
        let pid = worker.pid();
        if worker.is_alive() {
            SchedulerStats::bump(&self.stats.unloads);
            match worker.request(&WorkerMessage::unload(), self.options.unload_timeout) {
                Ok(reply) => {
                    if let Err(msg) = reply.into_reply() {
                        warn!("[SCHEDULER] worker {pid} failed to unload: {msg}");
                    }
                }
                Err(e) => warn!("[SCHEDULER] worker {pid} did not answer unload: {e}"),
            }

            SchedulerStats::bump(&self.stats.exits);
            if let Err(e) = worker.send(&WorkerMessage::exit()) {
                debug!("[SCHEDULER] exit not delivered to worker {pid}: {e}");
            }
            worker.close_stdin();
        }

        if worker.wait_for_exit(self.options.exit_timeout) {
            info!("[SCHEDULER] worker {pid} exited");
            return;
        }
        warn!("[SCHEDULER] worker {pid} ignored exit; terminating");
        worker.terminate();
        if !worker.wait_for_exit(self.options.kill_timeout) {
            worker.kill();
        }
    }

    /// Forced teardown after a failure: kill the worker and clear the slot.
    fn teardown(&self, slot: &mut Slot) {
        if let Some(mut worker) = slot.worker.take() {
            worker.kill();
        }
        slot.active = None;
        self.publish(slot);
        reclaim_host_memory();
    }

    pub fn get_current_model(&self) -> CurrentModel {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn gpu_memory(&self) -> Option<GpuMemory> {
        memory::gpu_memory()
    }

    pub fn host_memory(&self) -> HostMemory {
        memory::host_memory()
    }
}

impl Drop for ModelScheduler {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(mut worker) = slot.worker.take() {
            worker.kill();
        }
    }
}

/// Runs generations on the model loaded by [`ModelScheduler::load_model`].
pub struct Inference<'a> {
    scheduler: &'a ModelScheduler,
    task_type: TaskType,
    signature: LoraSignature,
}

impl Inference<'_> {
    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// One generation. Fails if another model was loaded in between.
    pub fn run(&self, params: Params) -> Result<Value> {
        self.scheduler.run(self.task_type, &self.signature, &params)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn options() -> SchedulerOptions {
        SchedulerOptions {
            load_timeout: Duration::from_millis(300),
            run_timeout: Duration::from_millis(300),
            unload_timeout: Duration::from_millis(300),
            exit_timeout: Duration::from_millis(300),
            kill_timeout: Duration::from_millis(300),
            max_load_attempts: 2,
        }
    }

    #[test]
    fn unload_without_a_model_is_a_no_op() {
        let scheduler = ModelScheduler::new(ProcessManager::new("true", Vec::new()), options());
        scheduler.unload_model();
        scheduler.unload_model();
        assert_eq!(scheduler.stats(), StatsSnapshot::default());
        assert!(!scheduler.get_current_model().is_loaded());
    }

    #[test]
    fn worker_that_exits_is_retried_once() {
        let scheduler = ModelScheduler::new(ProcessManager::new("true", Vec::new()), options());
        let err = scheduler
            .load_model(TaskType::Text2Img, None, Params::new())
            .err()
            .unwrap();
        assert!(matches!(err, GenError::ProcessCrash(_)), "{err:?}");
        let stats = scheduler.stats();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.loads, 2);
        assert_eq!(scheduler.get_current_model(), CurrentModel::default());
    }

    #[test]
    fn silent_worker_times_out_without_retry() {
        let scheduler = ModelScheduler::new(
            ProcessManager::new("sleep", vec!["30".to_string()]),
            options(),
        );
        let err = scheduler
            .load_model(TaskType::Text2Video, None, Params::new())
            .err()
            .unwrap();
        assert!(matches!(err, GenError::Timeout(_)), "{err:?}");
        assert_eq!(scheduler.stats().spawned, 1);
        assert!(scheduler.get_current_model().worker_pid.is_none());
    }

    #[test]
    fn unspawnable_worker_is_a_load_error() {
        let scheduler = ModelScheduler::new(
            ProcessManager::new("/nonexistent/genserve", Vec::new()),
            options(),
        );
        let err = scheduler
            .load_model(TaskType::Img2Img, None, Params::new())
            .err()
            .unwrap();
        assert!(matches!(err, GenError::Load(_)));
        assert_eq!(scheduler.stats().spawned, 0);
    }

    #[test]
    fn options_follow_config() {
        let config = SchedulerConfig {
            max_load_attempts: 0,
            ..Default::default()
        };
        let options = SchedulerOptions::from(&config);
        assert_eq!(options.max_load_attempts, 1);
        assert_eq!(options.load_timeout, Duration::from_secs(600));
        assert_eq!(options.exit_timeout, Duration::from_secs(5));
    }
}
