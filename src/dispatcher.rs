//! Task dispatcher: the single consumer of the task queue.
//!
//! A consumer thread pulls deliveries from the queue transport and hands
//! them over an internal channel to one executor thread, which runs each
//! task to completion under a lock before taking the next. The transport
//! loop never blocks on inference.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use genserve_config::{AppConfig, LoraCatalog};
use genserve_db::{consume, Delivery, ReconnectPolicy, RenderMark, TaskManager};
use genserve_types::{
    current_timestamp_f64, GenError, LoraConfig, Params, Result, TaskRecord, TaskStatus, TaskType,
};
use genserve_worker::ModelScheduler;
use log::{error, info, warn};
use serde_json::{json, Value};

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
    /// Missing or no longer pending; acknowledged without running.
    Skipped(String),
    /// The store failed before the task was claimed; the task is still
    /// pending and its message goes back on the queue.
    Retry(String),
}

pub struct TaskDispatcher {
    tasks: Arc<TaskManager>,
    scheduler: Arc<ModelScheduler>,
    catalog: Arc<LoraCatalog>,
    config: Arc<AppConfig>,
    run_lock: Mutex<()>,
}

impl TaskDispatcher {
    pub fn new(
        tasks: Arc<TaskManager>,
        scheduler: Arc<ModelScheduler>,
        catalog: Arc<LoraCatalog>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            tasks,
            scheduler,
            catalog,
            config,
            run_lock: Mutex::new(()),
        }
    }

    pub fn scheduler(&self) -> &Arc<ModelScheduler> {
        &self.scheduler
    }

    /// Run one task by id and record its outcome in the store.
    pub fn process_task(&self, task_id: &str) -> TaskOutcome {
        let _running = self.run_lock.lock().unwrap_or_else(|e| e.into_inner());

        let record = match self.tasks.get_task(task_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("[DISPATCHER] task {task_id} not found; dropping message");
                return TaskOutcome::Skipped("task not found".into());
            }
            Err(e) => {
                error!("[DISPATCHER] cannot read task {task_id}: {e}");
                return TaskOutcome::Retry(e.to_string());
            }
        };
        if record.status != TaskStatus::Pending {
            warn!(
                "[DISPATCHER] task {task_id} is {}, not pending; dropping message",
                record.status
            );
            return TaskOutcome::Skipped(format!("task is {}", record.status));
        }

        info!("[DISPATCHER] processing {} task {task_id}", record.task_type);
        if let Err(e) = self
            .tasks
            .update_task_status(task_id, TaskStatus::Processing, None, None)
        {
            error!("[DISPATCHER] cannot claim task {task_id}: {e}");
            return TaskOutcome::Retry(e.to_string());
        }

        // from here on the task is processing: every failure must end in `failed`
        if let Err(e) = self.mark(task_id, RenderMark::Start) {
            let message = format!("cannot record render start: {e}");
            error!("[DISPATCHER] task {task_id}: {message}");
            self.fail(task_id, &message);
            return TaskOutcome::Failed(message);
        }

        match self.execute(&record) {
            Ok(result) => {
                if let Err(e) = self.tasks.update_task_status(
                    task_id,
                    TaskStatus::Completed,
                    Some(result.clone()),
                    None,
                ) {
                    let message = format!("finished but the result was not saved: {e}");
                    error!("[DISPATCHER] task {task_id} {message}");
                    self.fail(task_id, &message);
                    return TaskOutcome::Failed(message);
                }
                if let Err(e) = self.mark(task_id, RenderMark::End) {
                    warn!("[DISPATCHER] task {task_id} completed without a render end time: {e}");
                }
                info!("[DISPATCHER] task {task_id} completed");
                TaskOutcome::Completed(result)
            }
            Err(e) => {
                let message = e.to_string();
                error!("[DISPATCHER] task {task_id} failed: {message}");
                self.fail(task_id, &message);
                TaskOutcome::Failed(message)
            }
        }
    }

    fn mark(&self, task_id: &str, mark: RenderMark) -> Result<()> {
        self.tasks
            .update_render_time(task_id, mark, current_timestamp_f64())
            .map(|_| ())
    }

    /// Record the failure and reset the accelerator: a failed task may have
    /// left the engine in an unknown state. Store errors are logged; the
    /// task is then failed by the next startup's interrupted-task sweep.
    fn fail(&self, task_id: &str, message: &str) {
        let stored = self
            .tasks
            .update_task_status(task_id, TaskStatus::Failed, None, Some(message.to_string()))
            .and_then(|_| self.mark(task_id, RenderMark::End));
        if let Err(e) = stored {
            error!("[DISPATCHER] could not record failure of task {task_id}: {e}");
        }
        self.scheduler.unload_model();
    }

    fn execute(&self, record: &TaskRecord) -> Result<Value> {
        let task_type = record.task_type;
        let loras = self.resolve_loras(task_type, &record.params)?;

        let inference = self.scheduler.load_model(
            task_type,
            loras.as_deref(),
            self.config.engine_params(task_type),
        )?;

        let mut params = record.params.clone();
        params.remove("lora_ids");
        params.insert(
            "lora_configs".into(),
            serde_json::to_value(loras.unwrap_or_default())?,
        );
        params.insert(
            "output_dir".into(),
            json!(self.config.output_dir(task_type).to_string_lossy()),
        );
        params.insert("output_name".into(), json!(record.task_id));
        inference.run(params)
    }

    /// Catalog entries for the task's `lora_ids`, or `None` without any.
    fn resolve_loras(&self, task_type: TaskType, params: &Params) -> Result<Option<Vec<LoraConfig>>> {
        let ids: Vec<i64> = match params.get("lora_ids") {
            None | Some(Value::Null) => return Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| GenError::Validation(format!("lora_ids must be a list of integers: {e}")))?,
        };
        if ids.is_empty() {
            return Ok(None);
        }
        self.catalog.validate_files(task_type, &ids)?;
        self.catalog.resolve(task_type, &ids).map(Some)
    }

    /// Process a delivery and settle it with the transport. Failed tasks are
    /// rejected without requeueing; store errors before the task was claimed
    /// requeue the message.
    pub fn handle_delivery(&self, delivery: &Delivery) -> TaskOutcome {
        let task_id = delivery.payload.trim();
        if delivery.redelivered {
            info!("[DISPATCHER] redelivered message for task {task_id}");
        }
        let outcome = self.process_task(task_id);
        let queue = self.tasks.queue();
        let settled = match &outcome {
            TaskOutcome::Failed(_) => queue.nack(delivery, false),
            TaskOutcome::Retry(_) => queue.nack(delivery, true),
            TaskOutcome::Completed(_) | TaskOutcome::Skipped(_) => queue.ack(delivery),
        };
        if let Err(e) = settled {
            error!("[DISPATCHER] could not settle delivery for task {task_id}: {e}");
        }
        outcome
    }

    /// Start the consumer and executor threads.
    pub fn start(self: Arc<Self>) -> anyhow::Result<DispatcherHandle> {
        match self.tasks.fail_interrupted() {
            Ok(0) => {}
            Ok(n) => warn!("[DISPATCHER] failed {n} task(s) interrupted by a previous shutdown"),
            Err(e) => warn!("[DISPATCHER] could not check for interrupted tasks: {e}"),
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx): (Sender<Delivery>, Receiver<Delivery>) = crossbeam_channel::unbounded();

        let executor = {
            let dispatcher = self.clone();
            let backoff = self.config.queue.poll_interval();
            thread::Builder::new()
                .name("dispatcher-executor".into())
                .spawn(move || {
                    for delivery in rx {
                        if let TaskOutcome::Retry(_) = dispatcher.handle_delivery(&delivery) {
                            // the requeued message comes straight back; let the store recover
                            thread::sleep(backoff);
                        }
                    }
                    info!("[DISPATCHER] executor stopped");
                })
                .context("cannot start dispatcher executor thread")?
        };

        let consumer = {
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            let queue_config = self.config.queue.clone();
            thread::Builder::new()
                .name("dispatcher-consumer".into())
                .spawn(move || {
                    let policy = ReconnectPolicy::from(&queue_config);
                    let tasks = &dispatcher.tasks;
                    info!("[DISPATCHER] consuming {}", tasks.queue_name());
                    consume(
                        tasks.queue().as_ref(),
                        tasks.queue_name(),
                        queue_config.poll_interval(),
                        &policy,
                        &shutdown,
                        |delivery| {
                            if tx.send(delivery).is_err() {
                                warn!("[DISPATCHER] executor is gone; stopping consumer");
                                shutdown.store(true, Ordering::SeqCst);
                            }
                        },
                    )
                })
                .context("cannot start dispatcher consumer thread")?
        };

        Ok(DispatcherHandle {
            dispatcher: self,
            shutdown,
            consumer: Some(consumer),
            executor: Some(executor),
        })
    }
}

/// Why [`DispatcherHandle::until_stopped`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Signal,
    /// The consumer gave up on the queue; `stop` reports its error.
    ConsumerExited,
}

/// Running dispatcher threads.
pub struct DispatcherHandle {
    dispatcher: Arc<TaskDispatcher>,
    shutdown: Arc<AtomicBool>,
    consumer: Option<JoinHandle<Result<()>>>,
    executor: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn is_finished(&self) -> bool {
        self.consumer.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for `signal` or for the consumer thread to exit, whichever
    /// comes first.
    pub async fn until_stopped<F>(&self, signal: F) -> StopReason
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                () = &mut signal => return StopReason::Signal,
                _ = ticker.tick() => {
                    if self.is_finished() {
                        error!("[DISPATCHER] queue consumer exited");
                        return StopReason::ConsumerExited;
                    }
                }
            }
        }
    }

    /// Stop consuming, let the in-flight task finish, then unload the model.
    pub fn stop(mut self) -> anyhow::Result<()> {
        info!("[DISPATCHER] stopping");
        self.shutdown.store(true, Ordering::SeqCst);

        let consumed = match self.consumer.take().map(JoinHandle::join) {
            Some(Ok(result)) => result.context("queue consumer failed"),
            Some(Err(_)) => Err(anyhow::anyhow!("queue consumer thread panicked")),
            None => Ok(()),
        };
        // the consumer owned the sender; the executor drains and exits
        if let Some(executor) = self.executor.take() {
            if executor.join().is_err() {
                error!("[DISPATCHER] executor thread panicked");
            }
        }
        self.dispatcher.scheduler.unload_model();
        info!("[DISPATCHER] stopped");
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genserve_db::{MemoryTaskStore, QueueTransport};
    use genserve_worker::{ProcessManager, SchedulerOptions};

    /// A broker that is never reachable.
    struct DownQueue;

    impl QueueTransport for DownQueue {
        fn publish(&self, _queue: &str, _payload: &str) -> Result<()> {
            Err(GenError::Queue("connection refused".into()))
        }
        fn receive(&self, _queue: &str, _wait: Duration) -> Result<Option<Delivery>> {
            Err(GenError::Queue("connection refused".into()))
        }
        fn ack(&self, _delivery: &Delivery) -> Result<()> {
            Ok(())
        }
        fn nack(&self, _delivery: &Delivery, _requeue: bool) -> Result<()> {
            Ok(())
        }
        fn message_count(&self, _queue: &str) -> Result<usize> {
            Err(GenError::Queue("connection refused".into()))
        }
    }

    fn dispatcher(queue: Arc<dyn QueueTransport>) -> Arc<TaskDispatcher> {
        let mut config = AppConfig::default();
        config.queue.poll_interval_ms = 10;
        config.queue.reconnect_initial_delay_ms = 10;
        config.queue.reconnect_max_attempts = 1;
        let tasks = Arc::new(TaskManager::new(
            Arc::new(MemoryTaskStore::new()),
            queue,
            "ai_task_queue",
        ));
        let scheduler = Arc::new(ModelScheduler::new(
            ProcessManager::new("true", Vec::new()),
            SchedulerOptions::default(),
        ));
        let catalog = Arc::new(LoraCatalog::empty(&config.lora_dir));
        Arc::new(TaskDispatcher::new(tasks, scheduler, catalog, Arc::new(config)))
    }

    #[tokio::test]
    async fn dead_consumer_ends_the_wait() {
        let handle = dispatcher(Arc::new(DownQueue)).start().unwrap();

        let reason = tokio::time::timeout(
            Duration::from_secs(10),
            handle.until_stopped(std::future::pending()),
        )
        .await
        .expect("consumer exit was not noticed");
        assert_eq!(reason, StopReason::ConsumerExited);

        let err = tokio::task::spawn_blocking(move || handle.stop())
            .await
            .unwrap()
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"), "{err:#}");
    }

    #[tokio::test]
    async fn signal_ends_the_wait_while_consuming() {
        let queue = Arc::new(genserve_db::MemoryQueue::new());
        let handle = dispatcher(queue).start().unwrap();

        let reason = handle.until_stopped(async {}).await;
        assert_eq!(reason, StopReason::Signal);
        assert!(!handle.is_finished());
        tokio::task::spawn_blocking(move || handle.stop())
            .await
            .unwrap()
            .unwrap();
    }
}
