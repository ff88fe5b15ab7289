// Database schema definitions

use super::db_error;
use genserve_types::Result;
use rusqlite::Connection;

/// Task records keyed by task ID; `record` holds the full JSON document,
/// `status` and `created_at` are copied out for filtering and ordering.
const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    record TEXT NOT NULL
)
"#;

const CREATE_TASKS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_created
ON tasks(created_at DESC)
"#;

/// Durable queue. `state` is `ready` or `unacked`.
const CREATE_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'ready',
    delivery_count INTEGER NOT NULL DEFAULT 0,
    published_at INTEGER NOT NULL,
    delivered_at INTEGER
)
"#;

const CREATE_QUEUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_queue_ready
ON queue_messages(queue, state, id)
"#;

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
)
"#;

/// Initialize all database tables
pub fn initialize(conn: &Connection) -> Result<()> {
    let statements = [
        CREATE_TASKS_TABLE,
        CREATE_TASKS_INDEX,
        CREATE_QUEUE_TABLE,
        CREATE_QUEUE_INDEX,
        CREATE_SESSIONS_TABLE,
    ];

    for sql in statements {
        conn.execute(sql, []).map_err(db_error("initialize schema"))?;
    }

    Ok(())
}
