//! Task operations used by the API and the dispatcher.

use std::sync::Arc;

use genserve_types::{
    current_timestamp_secs, GenError, Params, Result, TaskPage, TaskRecord, TaskStatus, TaskType,
};
use log::{info, warn};
use serde_json::Value;

use super::queue::QueueTransport;
use super::store::TaskStore;

pub const MAX_PAGE_SIZE: usize = 50;

/// Which render timestamp to set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMark {
    Start,
    End,
}

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn QueueTransport>,
    queue_name: String,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn QueueTransport>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn queue(&self) -> &Arc<dyn QueueTransport> {
        &self.queue
    }

    /// Persist a pending task and publish its ID. The task type is checked
    /// before anything is written.
    pub fn create_task(&self, task_type: &str, params: Params) -> Result<String> {
        let task_type: TaskType = task_type.parse()?;
        self.create_typed(task_type, params)
    }

    pub fn create_typed(&self, task_type: TaskType, params: Params) -> Result<String> {
        let record = TaskRecord::new(task_type, params);
        let task_id = record.task_id.clone();
        self.store.set(&task_id, &record)?;

        if let Err(e) = self.queue.publish(&self.queue_name, &task_id) {
            // a pending record nobody will ever dispatch is worse than none
            if let Err(cleanup) = self.store.delete(&task_id) {
                warn!("[TASKS] failed to remove unpublished task {task_id}: {cleanup}");
            }
            return Err(e);
        }

        info!("[TASKS] created {task_type} task {task_id}");
        Ok(task_id)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.store.get(task_id)
    }

    /// Move a task to `status`, optionally recording a result or error.
    /// Returns `false` when the task does not exist.
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<bool> {
        let Some(mut record) = self.store.get(task_id)? else {
            return Ok(false);
        };
        // same-state writes only refresh a running task; finished ones are final
        let allowed = if record.status == status {
            !status.is_terminal()
        } else {
            record.status.can_transition_to(status)
        };
        if !allowed {
            return Err(GenError::Validation(format!(
                "task {task_id} cannot move from {} to {status}",
                record.status
            )));
        }
        record.status = status;
        if result.is_some() {
            record.result = result;
        }
        if error.is_some() {
            record.error = error;
        }
        record.updated_at = current_timestamp_secs();
        self.store.set(task_id, &record)?;
        Ok(true)
    }

    pub fn update_render_time(&self, task_id: &str, mark: RenderMark, timestamp: f64) -> Result<bool> {
        let Some(mut record) = self.store.get(task_id)? else {
            return Ok(false);
        };
        match mark {
            RenderMark::Start => record.render_start_time = Some(timestamp),
            RenderMark::End => record.render_end_time = Some(timestamp),
        }
        record.updated_at = current_timestamp_secs();
        self.store.set(task_id, &record)?;
        Ok(true)
    }

    /// Newest first, optionally filtered by status. `page` is 1-based and
    /// clamped to at least 1; `page_size` is clamped to 1..=50.
    pub fn get_task_list(
        &self,
        page: usize,
        page_size: usize,
        status: Option<TaskStatus>,
    ) -> Result<TaskPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let mut tasks: Vec<TaskRecord> = self
            .store
            .list()?
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        let total = tasks.len();
        let tasks = tasks
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(TaskPage {
            total,
            page,
            page_size,
            tasks,
        })
    }

    /// Reset a finished task to pending and publish it again.
    /// Returns `false` when the task does not exist.
    pub fn requeue_task(&self, task_id: &str) -> Result<bool> {
        let Some(mut record) = self.store.get(task_id)? else {
            return Ok(false);
        };
        if record.status == TaskStatus::Processing {
            return Err(GenError::Validation(format!(
                "task {task_id} is processing and cannot be requeued"
            )));
        }
        record.status = TaskStatus::Pending;
        record.result = None;
        record.error = None;
        record.render_start_time = None;
        record.render_end_time = None;
        record.updated_at = current_timestamp_secs();
        self.store.set(task_id, &record)?;
        self.queue.publish(&self.queue_name, task_id)?;
        info!("[TASKS] requeued task {task_id}");
        Ok(true)
    }

    /// Returns `false` when the task does not exist.
    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        let Some(record) = self.store.get(task_id)? else {
            return Ok(false);
        };
        if record.status == TaskStatus::Processing {
            return Err(GenError::Validation(format!(
                "task {task_id} is processing and cannot be deleted"
            )));
        }
        self.store.delete(task_id)
    }

    /// Fail tasks left `processing` by a dispatcher that died mid-task.
    pub fn fail_interrupted(&self) -> Result<usize> {
        let mut failed = 0;
        for record in self.store.list()? {
            if record.status != TaskStatus::Processing {
                continue;
            }
            self.update_task_status(
                &record.task_id,
                TaskStatus::Failed,
                None,
                Some("interrupted: dispatcher stopped before the task finished".to_string()),
            )?;
            warn!("[TASKS] marked interrupted task {} as failed", record.task_id);
            failed += 1;
        }
        Ok(failed)
    }
}
