//! Postgres-backed queue backend.
//!
//! Tasks live in a single `tasks` table. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never lease the same row.
//! Before each claim, rows of the queue whose `lease_expires_at` has passed
//! are charged a failed attempt and moved to `retrying` or `archived`, so a
//! task that keeps killing its worker cannot be leased forever.
//!
//! | SQLx error | Postgres code | QueueError |
//! |---|---|---|
//! | Database (unique violation) | `23505` | `AlreadyExists` (enqueue only) |
//! | anything else | | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use super::backend::{QueueBackend, QueueError, QueueStats};
use super::types::{
    AttemptRecord, LEASE_EXPIRED, Lease, QueueClass, TaskId, TaskRecord, TaskState,
};

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id               UUID PRIMARY KEY,
        task_type        TEXT NOT NULL,
        payload          BYTEA NOT NULL,
        queue            TEXT NOT NULL,
        max_retry        INTEGER NOT NULL,
        state            TEXT NOT NULL,
        retried          INTEGER NOT NULL DEFAULT 0,
        attempts         INTEGER NOT NULL DEFAULT 0,
        not_before       TIMESTAMPTZ NOT NULL,
        lease_owner      TEXT,
        lease_expires_at TIMESTAMPTZ,
        last_error       TEXT,
        history          JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS tasks_claim_idx ON tasks (queue, state, not_before)
    "#,
];

/// Mirrors `TaskRecord::expire_lease`. The `WHERE` is re-evaluated on the
/// locked row, so two claimers cannot charge the same expiry twice.
const EXPIRE_LEASES: &str = r#"
    UPDATE tasks
    SET retried = retried + 1,
        state = CASE WHEN retried + 1 >= max_retry THEN 'archived' ELSE 'retrying' END,
        not_before = now(),
        lease_owner = NULL,
        lease_expires_at = NULL,
        last_error = $2,
        history = history || jsonb_build_array(jsonb_build_object(
            'attempt', attempts,
            'started_at', updated_at,
            'finished_at', now(),
            'success', false,
            'error', $2::text,
            'duration_ms', GREATEST(0, FLOOR(EXTRACT(EPOCH FROM now() - updated_at) * 1000))::bigint
        )),
        updated_at = now()
    WHERE queue = $1
      AND state = 'active'
      AND lease_expires_at <= now()
    RETURNING id, state
"#;

const COLUMNS: &str = "id, task_type, payload, queue, max_retry, state, retried, attempts, \
     not_before, lease_owner, lease_expires_at, last_error, history, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgQueueBackend {
    pool: Arc<PgPool>,
}

impl PgQueueBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `tasks` table and its claim index if missing.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn exists(&self, id: TaskId) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT 1 AS one FROM tasks WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl QueueBackend for PgQueueBackend {
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type), err)]
    async fn enqueue(&self, task: TaskRecord) -> Result<TaskId, QueueError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, payload, queue, max_retry, state, retried, attempts,
                not_before, last_error, history, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(task.id.0)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.queue.as_str())
        .bind(task.max_retry as i32)
        .bind(task.state.as_str())
        .bind(task.retried as i32)
        .bind(task.attempts as i32)
        .bind(task.not_before)
        .bind(&task.last_error)
        .bind(Json(&task.history))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueError::AlreadyExists(task.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(task.id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn claim(
        &self,
        queue: QueueClass,
        worker: &str,
        lease_for: Duration,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let expired = sqlx::query(EXPIRE_LEASES)
            .bind(queue.as_str())
            .bind(LEASE_EXPIRED)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("expire_leases", e))?;
        for row in &expired {
            let id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("expire_leases", e))?;
            let state: String =
                row.try_get("state").map_err(|e| map_sqlx_error("expire_leases", e))?;
            warn!(task_id = %id, state = %state, "lease expired");
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET state = 'active',
                attempts = attempts + 1,
                lease_owner = $2,
                lease_expires_at = now() + make_interval(secs => $3),
                updated_at = now()
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = $1
                  AND state IN ('pending', 'retrying')
                  AND not_before <= now()
                ORDER BY not_before, created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(queue.as_str())
        .bind(worker)
        .bind(lease_for.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, state = task.state.as_str()), err)]
    async fn finish(&self, task: &TaskRecord, worker: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = $3,
                retried = $4,
                not_before = $5,
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = $6,
                history = $7,
                updated_at = $8
            WHERE id = $1 AND state = 'active' AND lease_owner = $2
            "#,
        )
        .bind(task.id.0)
        .bind(worker)
        .bind(task.state.as_str())
        .bind(task.retried as i32)
        .bind(task.not_before)
        .bind(&task.last_error)
        .bind(Json(&task.history))
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish", e))?;

        if result.rows_affected() == 0 {
            return Err(if self.exists(task.id).await? {
                QueueError::LeaseLost(task.id)
            } else {
                QueueError::NotFound(task.id)
            });
        }
        Ok(())
    }

    async fn list_by_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE state = $1 ORDER BY updated_at, id LIMIT $2"
        ))
        .bind(state.as_str())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn requeue_archived(&self, id: TaskId) -> Result<TaskRecord, QueueError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET state = 'pending',
                retried = 0,
                not_before = now(),
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'archived'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_archived", e))?;

        match row {
            Some(row) => task_from_row(&row),
            None if self.exists(id).await? => Err(QueueError::NotArchived(id)),
            None => Err(QueueError::NotFound(id)),
        }
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM tasks GROUP BY state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(column_error)?;
            let n: i64 = row.try_get("n").map_err(column_error)?;
            let state: TaskState = state.parse().map_err(QueueError::Storage)?;
            stats.add(state, n.max(0) as usize);
        }
        Ok(stats)
    }
}

fn task_from_row(row: &PgRow) -> Result<TaskRecord, QueueError> {
    let id: Uuid = row.try_get("id").map_err(column_error)?;
    let queue: String = row.try_get("queue").map_err(column_error)?;
    let state: String = row.try_get("state").map_err(column_error)?;
    let max_retry: i32 = row.try_get("max_retry").map_err(column_error)?;
    let retried: i32 = row.try_get("retried").map_err(column_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(column_error)?;
    let lease_owner: Option<String> = row.try_get("lease_owner").map_err(column_error)?;
    let lease_expires_at: Option<DateTime<Utc>> =
        row.try_get("lease_expires_at").map_err(column_error)?;
    let Json(history): Json<Vec<AttemptRecord>> = row.try_get("history").map_err(column_error)?;

    Ok(TaskRecord {
        id: TaskId::from_uuid(id),
        task_type: row.try_get("task_type").map_err(column_error)?,
        payload: row.try_get("payload").map_err(column_error)?,
        queue: queue.parse().map_err(QueueError::Storage)?,
        max_retry: max_retry.max(0) as u32,
        state: state.parse().map_err(QueueError::Storage)?,
        retried: retried.max(0) as u32,
        attempts: attempts.max(0) as u32,
        not_before: row.try_get("not_before").map_err(column_error)?,
        lease: match (lease_owner, lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
            _ => None,
        },
        last_error: row.try_get("last_error").map_err(column_error)?,
        created_at: row.try_get("created_at").map_err(column_error)?,
        updated_at: row.try_get("updated_at").map_err(column_error)?,
        history,
    })
}

fn column_error(err: sqlx::Error) -> QueueError {
    QueueError::Storage(format!("failed to read task row: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => QueueError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {operation}"))
        }
        other => QueueError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
