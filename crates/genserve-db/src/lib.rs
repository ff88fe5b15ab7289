// SQLite persistence for the generation service.
// Task records, the durable task queue and login sessions share one database
// file so the API and dispatcher processes can run separately.

pub mod manager;
pub mod queue;
pub mod schema;
pub mod sessions;
pub mod store;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use genserve_types::{GenError, Result};
use rusqlite::Connection;

pub use manager::{RenderMark, TaskManager};
pub use queue::{consume, Delivery, MemoryQueue, QueueTransport, ReconnectPolicy, SqliteQueue};
pub use sessions::SessionStore;
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskStore};

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

/// Shared database type for passing across threads
pub type SharedDatabase = Arc<Database>;

/// Map a SQLite error into a store error with context.
///
/// Usage: `.map_err(db_error("insert task"))?`
pub fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> GenError + '_ {
    move |e| GenError::Store(format!("failed to {context}: {e}"))
}

impl Database {
    /// Open (or create) the database and initialize the schema.
    /// `":memory:"` gives a private in-memory database.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_error("open database"))?;

        // Other processes may hold the write lock briefly.
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(db_error("set busy timeout"))?;
        if db_path != ":memory:" {
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
                .map_err(db_error("enable WAL"))?;
        }

        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get a reference to the connection (locked)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_file_database_and_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genserve.db");
        let db = Database::new(path.to_str().unwrap()).unwrap();
        let conn = db.connection();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('tasks', 'queue_messages', 'sessions')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn reopening_keeps_existing_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genserve.db");
        drop(Database::new(path.to_str().unwrap()).unwrap());
        assert!(Database::new(path.to_str().unwrap()).is_ok());
    }
}
