//! Durable command queue.
//!
//! One Postgres table, `queued_command`, holds commands that could not be
//! executed inline.  Rows are claimed in batches under `FOR UPDATE SKIP
//! LOCKED` so several processor instances on the same database drain
//! disjoint sets; all mutations of a claimed batch commit atomically when
//! the batch ends.
//!
//! `command_data` and `error_history` are JSON (the word list, and an
//! ordered list of `{timestamp, error}` entries).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row as _, Transaction};
use tokio::sync::RwLock;

/// A row is never retried once its retry counter reaches this.
pub const MAX_RETRIES: i32 = 4;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Processing => "processing",
            CommandStatus::Failed => "failed",
            CommandStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One `{timestamp, error}` entry in a row's failure history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// A queued command row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub id: i64,
    pub device_id: i64,
    pub words: Vec<String>,
    pub status: CommandStatus,
    pub retry_count: i32,
    pub error_history: Vec<ErrorEntry>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Error type for queue operations.
#[derive(Debug)]
pub enum QueueError {
    Sqlx(sqlx::Error),
    Migrate(sqlx::migrate::MigrateError),
    /// A stored JSON payload did not decode.
    Data(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Sqlx(e) => write!(f, "database error: {}", e),
            QueueError::Migrate(e) => write!(f, "migration error: {}", e),
            QueueError::Data(s) => write!(f, "invalid queue data: {}", s),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Sqlx(e)
    }
}

impl From<sqlx::migrate::MigrateError> for QueueError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        QueueError::Migrate(e)
    }
}

// ---------------------------------------------------------------------------
// CommandSink seam
// ---------------------------------------------------------------------------

/// Enqueue surface the session handler depends on; stubbed in tests.
pub trait CommandSink: Send + Sync + 'static {
    fn enqueue(
        &self,
        device_id: i64,
        words: &[String],
    ) -> impl std::future::Future<Output = Result<i64, QueueError>> + Send;
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

/// Handle to the durable queue.  The pool is swappable so `reconnect_db`
/// can pick up a changed DSN without restarting the daemon.
pub struct CommandQueue {
    pool: RwLock<PgPool>,
}

impl CommandQueue {
    /// Connect to the durable store and run migrations.
    pub async fn connect(dsn: &str) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(dsn).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(CommandQueue {
            pool: RwLock::new(pool),
        })
    }

    /// Build a handle without touching the database.  Every operation will
    /// fail until the DSN is reachable; used by tests and tooling.
    pub fn connect_lazy(dsn: &str) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new().max_connections(10).connect_lazy(dsn)?;
        Ok(CommandQueue {
            pool: RwLock::new(pool),
        })
    }

    /// Replace the pool with a fresh connection to `dsn`.
    pub async fn reconnect(&self, dsn: &str) -> Result<(), QueueError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(dsn).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let old = std::mem::replace(&mut *self.pool.write().await, pool);
        old.close().await;
        Ok(())
    }

    async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    /// Append a command for later execution; returns the new row id.
    pub async fn enqueue(&self, device_id: i64, words: &[String]) -> Result<i64, QueueError> {
        let data =
            serde_json::to_string(words).map_err(|e| QueueError::Data(e.to_string()))?;
        let row = sqlx::query(
            "INSERT INTO queued_command (device_id, command_data, status)
             VALUES ($1, $2, 'pending')
             RETURNING id",
        )
        .bind(device_id)
        .bind(data)
        .fetch_one(&self.pool().await)
        .await?;
        Ok(row.get("id"))
    }

    /// Claim up to `limit` retryable rows inside a new transaction.
    ///
    /// Claimed rows are moved to `processing` and stay row-locked until the
    /// returned batch commits or rolls back.  Oldest rows first, so replay
    /// is FIFO per device.
    pub async fn claim_batch(&self, limit: i64) -> Result<ClaimedBatch, QueueError> {
        let mut tx = self.pool().await.begin().await?;
        let rows = sqlx::query(
            "SELECT id, device_id, command_data, status, retry_count, error_history,
                    created_at, processed_at
             FROM queued_command
             WHERE status IN ('pending', 'failed') AND retry_count < $1
             ORDER BY created_at ASC, id ASC
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(MAX_RETRIES)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut commands = Vec::with_capacity(rows.len());
        for row in &rows {
            commands.push(map_row(row)?);
        }

        if !commands.is_empty() {
            let ids: Vec<i64> = commands.iter().map(|c| c.id).collect();
            sqlx::query("UPDATE queued_command SET status = 'processing' WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }

        Ok(ClaimedBatch { tx, rows: commands })
    }

    /// Administrative bulk delete; returns the number of removed rows.
    pub async fn clear_all(&self) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM queued_command")
            .execute(&self.pool().await)
            .await?;
        Ok(result.rows_affected())
    }

    /// Page through the queue (1-based pages, oldest first) for the admin
    /// UI; returns the page plus the total row count.
    pub async fn list(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<QueuedCommand>, i64), QueueError> {
        let pool = self.pool().await;
        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);
        let rows = sqlx::query(
            "SELECT id, device_id, command_data, status, retry_count, error_history,
                    created_at, processed_at
             FROM queued_command
             ORDER BY created_at ASC, id ASC
             LIMIT $1 OFFSET $2",
        )
        .bind(i64::from(per_page))
        .bind(offset)
        .fetch_all(&pool)
        .await?;
        let mut commands = Vec::with_capacity(rows.len());
        for row in &rows {
            commands.push(map_row(row)?);
        }
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM queued_command")
            .fetch_one(&pool)
            .await?
            .get("n");
        Ok((commands, total))
    }
}

impl CommandSink for CommandQueue {
    fn enqueue(
        &self,
        device_id: i64,
        words: &[String],
    ) -> impl std::future::Future<Output = Result<i64, QueueError>> + Send {
        CommandQueue::enqueue(self, device_id, words)
    }
}

// ---------------------------------------------------------------------------
// ClaimedBatch
// ---------------------------------------------------------------------------

/// A claimed set of rows and the transaction that locks them.
///
/// Every mutation happens on this transaction; nothing is visible to other
/// processors until [`ClaimedBatch::commit`].
pub struct ClaimedBatch {
    tx: Transaction<'static, Postgres>,
    pub rows: Vec<QueuedCommand>,
}

impl ClaimedBatch {
    /// The command succeeded: remove the row.
    pub async fn complete(&mut self, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queued_command WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Record a failure on a claimed row.
    ///
    /// Appends to the error history, increments the retry counter, and
    /// stamps `processed_at`.  When `terminal`, the row is deleted instead
    /// (history and all); a logical trap and the final transient retry both
    /// end here.
    pub async fn fail(
        &mut self,
        row: &QueuedCommand,
        error: &str,
        terminal: bool,
    ) -> Result<(), QueueError> {
        let mut history = row.error_history.clone();
        history.push(ErrorEntry {
            timestamp: Utc::now(),
            error: error.to_owned(),
        });

        if terminal {
            sqlx::query("DELETE FROM queued_command WHERE id = $1")
                .bind(row.id)
                .execute(&mut *self.tx)
                .await?;
            return Ok(());
        }

        let history_json =
            serde_json::to_string(&history).map_err(|e| QueueError::Data(e.to_string()))?;
        sqlx::query(
            "UPDATE queued_command
             SET status = 'failed', retry_count = retry_count + 1,
                 error_history = $2, processed_at = now()
             WHERE id = $1",
        )
        .bind(row.id)
        .bind(history_json)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Put a claimed row back to `pending` without counting a retry; used
    /// when the live-client idle guard defers the row to a later cycle.
    pub async fn reset(&mut self, id: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE queued_command SET status = 'pending' WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), QueueError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), QueueError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn map_row(row: &sqlx::postgres::PgRow) -> Result<QueuedCommand, QueueError> {
    let status_text: String = row.get("status");
    let status = CommandStatus::parse(&status_text)
        .ok_or_else(|| QueueError::Data(format!("unknown status '{}'", status_text)))?;
    let command_data: String = row.get("command_data");
    let words: Vec<String> = serde_json::from_str(&command_data)
        .map_err(|e| QueueError::Data(format!("command_data: {}", e)))?;
    let history_text: String = row.get("error_history");
    let error_history: Vec<ErrorEntry> = serde_json::from_str(&history_text)
        .map_err(|e| QueueError::Data(format!("error_history: {}", e)))?;
    Ok(QueuedCommand {
        id: row.get("id"),
        device_id: row.get("device_id"),
        words,
        status,
        retry_count: row.get("retry_count"),
        error_history,
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
    })
}
