//! Write-through plan cache backed by `SQLite`.
//!
//! Entries exist only so a restarted client can show the last known plan
//! for a conversation. The backend stays authoritative.

use super::ExecutionPlan;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub struct WorkflowSessionCache {
    db: Mutex<Connection>,
}

impl WorkflowSessionCache {
    /// Open or create a cache at the given path.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::InvalidData(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(db)
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self, CacheError> {
        init_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn db(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| {
            warn!("workflow cache lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn save(&self, conversation_id: &str, plan: &ExecutionPlan) -> Result<(), CacheError> {
        let json = serde_json::to_string(plan)?;
        let now = chrono::Utc::now().timestamp();
        self.db().execute(
            r"
            INSERT INTO workflow_plans (conversation_id, plan, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(conversation_id) DO UPDATE SET
                plan = excluded.plan,
                updated_at = excluded.updated_at
            ",
            params![conversation_id, json, now],
        )?;
        debug!(conversation_id, steps = plan.steps.len(), "cached execution plan");
        Ok(())
    }

    /// Last saved plan. A corrupt entry counts as a miss and is dropped.
    pub fn load(&self, conversation_id: &str) -> Result<Option<ExecutionPlan>, CacheError> {
        let json: Option<String> = self
            .db()
            .query_row(
                "SELECT plan FROM workflow_plans WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(json) = json else {
            return Ok(None);
        };

        match serde_json::from_str(&json) {
            Ok(plan) => Ok(Some(plan)),
            Err(e) => {
                warn!(conversation_id, "dropping unreadable cached plan: {}", e);
                self.remove(conversation_id)?;
                Ok(None)
            }
        }
    }

    /// Returns true if an entry was removed.
    pub fn remove(&self, conversation_id: &str) -> Result<bool, CacheError> {
        let deleted = self.db().execute(
            "DELETE FROM workflow_plans WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(deleted > 0)
    }

    /// Delete entries not updated in the given number of days.
    pub fn prune_older_than(&self, retention_days: u32) -> Result<usize, CacheError> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = chrono::Utc::now().timestamp() - i64::from(retention_days) * 86400;
        let deleted = self.db().execute(
            "DELETE FROM workflow_plans WHERE updated_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

fn init_schema(db: &Connection) -> Result<(), CacheError> {
    let version: i32 = db.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < SCHEMA_VERSION {
        db.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS workflow_plans (
                conversation_id TEXT PRIMARY KEY,
                plan            TEXT NOT NULL,
                updated_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_workflow_plans_updated
                ON workflow_plans(updated_at DESC);

            PRAGMA user_version = 1;
            ",
        )?;
    }

    Ok(())
}
