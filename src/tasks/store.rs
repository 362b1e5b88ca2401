//! # Task Store
//!
//! Durable CRUD over task rows plus the atomic state transitions the
//! scheduler depends on. The database is the single authority for task
//! state; every transition is written here before anything else reacts
//! to it.
//!
//! The claim path is a candidate SELECT (priority, then age, dependency
//! satisfied via an EXISTS join) followed by an optimistic
//! `UPDATE ... WHERE status = 'pending'` — losing a race simply moves on to
//! the next candidate, so parallel claimers never double-run a task.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

use super::types::{NewTask, Task, TaskFilter, TaskRow, TaskStatus, TaskStatusCounts};

const TASK_COLUMNS: &str = "id, operation, target, priority, status, depends_on, metadata, \
     progress_percent, progress_info, error_message, created_by, created_at, updated_at, \
     started_at, completed_at";

/// How many eligible rows the claim path inspects per attempt. Claim races
/// only arise between parallel engines sharing one database, so a short
/// window is plenty.
const CLAIM_CANDIDATE_LIMIT: i64 = 8;

/// Outcome of a user cancellation request
#[derive(Debug)]
pub enum CancelOutcome {
    Cancelled(Task),
    /// Only `pending` tasks can be cancelled; carries the current status
    NotPending(TaskStatus),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a task as `pending`
    pub async fn create(&self, spec: NewTask) -> EngineResult<Task> {
        if spec.operation.is_empty() {
            return Err(EngineError::Validation("operation must not be empty".into()));
        }

        let id = Uuid::now_v7();
        let row: TaskRow = sqlx::query_as(&format!(
            "INSERT INTO tasks (id, operation, target, priority, status, depends_on, metadata, created_by) \
             VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(&spec.operation)
        .bind(&spec.target)
        .bind(spec.priority.as_i16())
        .bind(spec.depends_on)
        .bind(&spec.metadata)
        .bind(&spec.created_by)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            task_id = %id,
            operation = %spec.operation,
            target = %spec.target,
            priority = ?spec.priority,
            "task enqueued"
        );

        row.try_into()
    }

    pub async fn get(&self, id: Uuid) -> EngineResult<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Task::try_from).transpose()
    }

    /// List tasks, newest first
    pub async fn list(&self, filter: &TaskFilter, default_limit: i64) -> EngineResult<Vec<Task>> {
        let mut qb = self.filtered_query(&format!("SELECT {TASK_COLUMNS} FROM tasks"), filter);
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(default_limit));

        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Total rows matching a filter (ignores `limit`)
    pub async fn count(&self, filter: &TaskFilter) -> EngineResult<i64> {
        let mut qb = self.filtered_query("SELECT count(*) FROM tasks", filter);
        let (count,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(count)
    }

    fn filtered_query<'a>(
        &self,
        select: &str,
        filter: &'a TaskFilter,
    ) -> QueryBuilder<'a, Postgres> {
        let mut qb = QueryBuilder::new(select);
        qb.push(" WHERE TRUE");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(target) = &filter.target {
            qb.push(" AND target = ").push_bind(target);
        }
        if let Some(operation) = &filter.operation {
            qb.push(" AND operation = ").push_bind(operation);
        }
        if let Some(operation_ne) = &filter.operation_ne {
            qb.push(" AND operation <> ").push_bind(operation_ne);
        }
        if let Some(since) = filter.since {
            qb.push(" AND updated_at > ").push_bind(since);
        }
        qb
    }

    pub async fn count_by_status(&self) -> EngineResult<TaskStatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = TaskStatusCounts::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => counts.pending = count,
                TaskStatus::Running => counts.running = count,
                TaskStatus::Completed => counts.completed = count,
                TaskStatus::Failed => counts.failed = count,
                TaskStatus::Cancelled => counts.cancelled = count,
            }
        }
        Ok(counts)
    }

    /// Claim the next runnable task: highest priority, oldest first, with a
    /// satisfied (or absent) dependency and an operation outside
    /// `excluded_operations`. On success the row is atomically moved to
    /// `running` with `started_at` set.
    pub async fn try_claim_next(
        &self,
        excluded_operations: &[String],
    ) -> EngineResult<Option<Task>> {
        let candidates: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT t.id FROM tasks t \
             WHERE t.status = 'pending' \
               AND t.operation <> ALL($1) \
               AND (t.depends_on IS NULL OR EXISTS ( \
                    SELECT 1 FROM tasks p \
                    WHERE p.id = t.depends_on AND p.status = 'completed')) \
             ORDER BY t.priority DESC, t.created_at ASC \
             LIMIT $2",
        )
        .bind(excluded_operations)
        .bind(CLAIM_CANDIDATE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        for (id,) in candidates {
            let claimed: Option<TaskRow> = sqlx::query_as(&format!(
                "UPDATE tasks \
                 SET status = 'running', started_at = now(), updated_at = now() \
                 WHERE id = $1 AND status = 'pending' \
                 RETURNING {TASK_COLUMNS}"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = claimed {
                return Ok(Some(row.try_into()?));
            }
            // Lost the race for this row; try the next candidate.
        }

        Ok(None)
    }

    /// Undo a claim that could not proceed (category lock race). The row
    /// returns to `pending` with `started_at` cleared.
    pub async fn revert_claim(&self, id: Uuid) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = 'pending', started_at = NULL, updated_at = now() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(task_id = %id, "claim revert found no running row");
        }
        Ok(())
    }

    /// Commit a terminal state for a running task. Completed tasks get
    /// `progress_percent` forced to 100.
    pub async fn finalize(
        &self,
        id: Uuid,
        status: TaskStatus,
        error_message: Option<&str>,
        progress_info: Option<&Value>,
    ) -> EngineResult<Option<Task>> {
        if !status.is_terminal() {
            return Err(EngineError::Internal(format!(
                "finalize called with non-terminal status {status}"
            )));
        }

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks \
             SET status = $2, \
                 error_message = $3, \
                 progress_info = COALESCE($4, progress_info), \
                 progress_percent = CASE WHEN $2 = 'completed' THEN 100 ELSE progress_percent END, \
                 completed_at = now(), \
                 updated_at = now() \
             WHERE id = $1 AND status = 'running' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(progress_info)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    /// Record handler progress while a task is running. Percent writes are
    /// monotonic; stale (lower) percents are ignored. Returns whether a row
    /// was updated.
    pub async fn record_progress(
        &self,
        id: Uuid,
        percent: Option<i16>,
        info: Option<&Value>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET progress_percent = GREATEST(progress_percent, COALESCE($2, progress_percent)), \
                 progress_info = COALESCE($3, progress_info), \
                 updated_at = now() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(percent)
        .bind(info)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel a pending task. Running and terminal tasks are refused with
    /// their current status.
    pub async fn cancel_pending(&self, id: Uuid) -> EngineResult<CancelOutcome> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks \
             SET status = 'cancelled', completed_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            info!(task_id = %id, "pending task cancelled");
            return Ok(CancelOutcome::Cancelled(row.try_into()?));
        }

        match self.get(id).await? {
            Some(task) => Ok(CancelOutcome::NotPending(task.status)),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// Startup recovery sweep: any row still `running` belonged to a dead
    /// process and is marked failed. Returns the number of orphans.
    pub async fn fail_orphaned_running(&self) -> EngineResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = 'failed', \
                 error_message = 'orphaned by restart', \
                 completed_at = now(), \
                 updated_at = now() \
             WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await?;

        let orphaned = result.rows_affected();
        if orphaned > 0 {
            warn!(orphaned = orphaned, "failed orphaned running tasks from previous process");
        }
        Ok(orphaned)
    }

    /// Retention cleanup: destroy terminal rows created before `cutoff`
    pub async fn destroy_terminal_older_than(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query(
            "DELETE FROM tasks \
             WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Currently-running rows for one operation; used by the artifact scan
    /// to snapshot in-flight downloads.
    pub async fn running_for_operation(&self, operation: &str) -> EngineResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'running' AND operation = $1"
        ))
        .bind(operation)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }
}
