//! Login session tokens.

use genserve_types::{current_timestamp_secs, Result};
use rusqlite::{params, OptionalExtension};

use super::{db_error, SharedDatabase};

pub struct SessionStore {
    db: SharedDatabase,
}

impl SessionStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Issue a new bearer token.
    pub fn create(&self) -> Result<String> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let conn = self.db.connection();
        conn.execute(
            "INSERT INTO sessions (token, created_at) VALUES (?1, ?2)",
            params![token, current_timestamp_secs()],
        )
        .map_err(db_error("create session"))?;
        Ok(token)
    }

    pub fn is_valid(&self, token: &str) -> Result<bool> {
        let conn = self.db.connection();
        let found: Option<i64> = conn
            .query_row(
                "SELECT created_at FROM sessions WHERE token = ?1",
                [token],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error("look up session"))?;
        Ok(found.is_some())
    }

    pub fn revoke(&self, token: &str) -> Result<bool> {
        let conn = self.db.connection();
        let removed = conn
            .execute("DELETE FROM sessions WHERE token = ?1", [token])
            .map_err(db_error("revoke session"))?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use std::sync::Arc;

    #[test]
    fn issued_tokens_validate_until_revoked() {
        let sessions = SessionStore::new(Arc::new(Database::new(":memory:").unwrap()));
        let token = sessions.create().unwrap();
        assert_eq!(token.len(), 32);
        assert!(sessions.is_valid(&token).unwrap());
        assert!(!sessions.is_valid("forged").unwrap());
        assert!(sessions.revoke(&token).unwrap());
        assert!(!sessions.is_valid(&token).unwrap());
    }
}
