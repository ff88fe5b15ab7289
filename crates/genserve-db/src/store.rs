//! Task record storage.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use genserve_types::{Result, TaskRecord};
use log::warn;
use rusqlite::{params, OptionalExtension};

use super::{db_error, SharedDatabase};

/// Key-value store of task records keyed by task ID.
pub trait TaskStore: Send + Sync {
    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;
    fn set(&self, task_id: &str, record: &TaskRecord) -> Result<()>;
    /// Returns whether a record was removed.
    fn delete(&self, task_id: &str) -> Result<bool>;
    /// Every stored record, in no particular order.
    fn list(&self) -> Result<Vec<TaskRecord>>;
}

pub struct SqliteTaskStore {
    db: SharedDatabase,
}

impl SqliteTaskStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

impl TaskStore for SqliteTaskStore {
    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.db.connection();
        let raw: Option<String> = conn
            .query_row(
                "SELECT record FROM tasks WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error("get task"))?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set(&self, task_id: &str, record: &TaskRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        let conn = self.db.connection();
        conn.execute(
            "INSERT OR REPLACE INTO tasks (task_id, status, created_at, record) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, record.status.as_str(), record.created_at, raw],
        )
        .map_err(db_error("save task"))?;
        Ok(())
    }

    fn delete(&self, task_id: &str) -> Result<bool> {
        let conn = self.db.connection();
        let removed = conn
            .execute("DELETE FROM tasks WHERE task_id = ?1", [task_id])
            .map_err(db_error("delete task"))?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.db.connection();
        let mut stmt = conn
            .prepare("SELECT task_id, record FROM tasks")
            .map_err(db_error("prepare task list"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_error("list tasks"))?;

        let mut records = Vec::new();
        for row in rows {
            let (task_id, raw) = row.map_err(db_error("read task row"))?;
            match serde_json::from_str(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!("[DB] skipping unreadable task record {task_id}: {e}"),
            }
        }
        Ok(records)
    }
}

/// In-process store holding serialized records, for tests and single-process
/// development runs.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get(task_id) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn set(&self, task_id: &str, record: &TaskRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), raw);
        Ok(())
    }

    fn delete(&self, task_id: &str) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
            .is_some())
    }

    fn list(&self) -> Result<Vec<TaskRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .values()
            .map(|raw| Ok(serde_json::from_str::<TaskRecord>(raw)?))
            .collect()
    }
}
