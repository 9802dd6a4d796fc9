//! Database storage layer for Callflow Server

use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

use crate::models::*;

pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Outcome of a status change request.
#[derive(Debug)]
pub enum StatusChange {
    Applied(CallLog),
    NotFound,
    Rejected { current: String },
}

impl Storage {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        let in_memory = database_path == ":memory:";

        let database_url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            // Ensure directory exists
            if let Some(parent) = Path::new(database_path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            format!("sqlite:{}?mode=rwc", database_path)
        };

        // Every connection to `:memory:` opens its own database, so keep exactly one alive
        let mut options = SqlitePoolOptions::new().max_connections(10);
        if in_memory {
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = options.connect(&database_url).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS call_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id TEXT NOT NULL,
                caller_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ringing',
                duration INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_call_logs_caller ON call_logs(caller_id);
            CREATE INDEX IF NOT EXISTS idx_call_logs_receiver ON call_logs(receiver_id);
            CREATE INDEX IF NOT EXISTS idx_call_logs_status ON call_logs(status, created_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Call log operations
    // ========================================================================

    pub async fn create_call(&self, caller_id: &str, request: &StartCallRequest) -> anyhow::Result<CallLog> {
        let result = sqlx::query(
            "INSERT INTO call_logs (room_id, caller_id, receiver_id, call_type) VALUES (?, ?, ?, ?)",
        )
        .bind(&request.room_id)
        .bind(caller_id)
        .bind(&request.receiver_id)
        .bind(request.call_type.as_str())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_call(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("call log {} vanished after insert", id))
    }

    pub async fn get_call(&self, id: i64) -> anyhow::Result<Option<CallLog>> {
        let call = sqlx::query_as::<_, CallLog>("SELECT * FROM call_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(call)
    }

    /// Apply a status change if the stored row still allows it.
    ///
    /// The update is conditional on the status read, so two racing writers
    /// cannot both move a row out of the same state.
    pub async fn update_call_status(
        &self,
        id: i64,
        status: CallLogStatus,
        duration: Option<i64>,
    ) -> anyhow::Result<StatusChange> {
        let Some(call) = self.get_call(id).await? else {
            return Ok(StatusChange::NotFound);
        };

        let allowed = call
            .status()
            .map(|current| current.can_become(status))
            .unwrap_or(false);
        if !allowed {
            return Ok(StatusChange::Rejected { current: call.status });
        }

        let result = sqlx::query(
            r#"
            UPDATE call_logs
            SET status = ?, duration = COALESCE(?, duration), updated_at = datetime('now')
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(duration)
        .bind(id)
        .bind(&call.status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self
                .get_call(id)
                .await?
                .map(|c| c.status)
                .unwrap_or_default();
            return Ok(StatusChange::Rejected { current });
        }

        match self.get_call(id).await? {
            Some(updated) => Ok(StatusChange::Applied(updated)),
            None => Ok(StatusChange::NotFound),
        }
    }

    /// Calls the user took part in, newest first.
    pub async fn list_calls_for_user(&self, user_id: &str, limit: i64) -> anyhow::Result<Vec<CallLog>> {
        let calls = sqlx::query_as::<_, CallLog>(
            r#"
            SELECT * FROM call_logs
            WHERE caller_id = ? OR receiver_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(calls)
    }

    /// Mark rows that have been ringing for too long as missed.
    pub async fn mark_stale_ringing(&self, older_than_minutes: u64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE call_logs
            SET status = 'missed', updated_at = datetime('now')
            WHERE status = 'ringing' AND created_at <= datetime('now', ?)
            "#,
        )
        .bind(format!("-{} minutes", older_than_minutes))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_calls(&self) -> anyhow::Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM call_logs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
