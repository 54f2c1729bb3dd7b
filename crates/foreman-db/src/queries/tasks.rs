//! Database query functions for the `tasks` table.
//!
//! Every mutator is a single statement so the row can never be observed
//! half-updated; `assign_task` in particular writes `assigned_worker` and
//! `status` in one UPDATE.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row with `status = PENDING` and a fresh retry budget.
/// Returns the inserted task with server-generated timestamps.
pub async fn insert_task(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    data: &str,
    priority: i32,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, name, data, priority) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(data)
    .bind(priority)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Update the status of a task, bumping `updated_at` and setting
/// `completed_at` exactly when the new status is `COMPLETED`.
pub async fn set_task_status(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             updated_at = now(), \
             completed_at = CASE WHEN $1 = 'COMPLETED' THEN now() ELSE NULL END \
         WHERE id = $2",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Atomically set `assigned_worker` and `status` in one UPDATE.
///
/// The single statement guarantees no row is ever visible with a worker
/// attached while still `PENDING`.
pub async fn assign_task(
    pool: &PgPool,
    id: Uuid,
    worker_id: Uuid,
    status: TaskStatus,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET assigned_worker = $1, \
             status = $2, \
             updated_at = now(), \
             completed_at = CASE WHEN $2 = 'COMPLETED' THEN now() ELSE NULL END \
         WHERE id = $3",
    )
    .bind(worker_id)
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to assign task")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Mark a task completed by a specific worker.
///
/// Records which worker finished the task; there is deliberately no
/// worker-less variant.
pub async fn complete_task(pool: &PgPool, id: Uuid, worker_id: Uuid) -> Result<()> {
    assign_task(pool, id, worker_id, TaskStatus::Completed).await
}

/// List all `PENDING` tasks in dispatch order: highest priority first,
/// oldest first within a priority, id bytes as the final tie-break.
pub async fn list_pending(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'PENDING' \
         ORDER BY priority DESC, created_at ASC, id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pending tasks")?;

    Ok(tasks)
}

/// List completed tasks ordered by priority ascending.
pub async fn list_completed(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'COMPLETED' \
         ORDER BY priority ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list completed tasks")?;

    Ok(tasks)
}

/// Return a dispatched task to `PENDING`: clear `assigned_worker` and charge
/// one unit of the retry budget. Returns the updated row so the caller can
/// check [`Task::retries_exhausted`].
///
/// Used when a `new_task` send fails and when the sweep reclaims tasks from
/// a dead worker.
pub async fn release_task(pool: &PgPool, id: Uuid) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'PENDING', \
             assigned_worker = NULL, \
             retry_count = retry_count + 1, \
             updated_at = now(), \
             completed_at = NULL \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to release task")?
    .with_context(|| format!("task {id} not found"))?;

    Ok(task)
}

/// Release every `IN_PROGRESS` task currently assigned to a worker.
///
/// This is the sweep's recovery path for workers that disappeared mid-task:
/// each row goes back to `PENDING` with the worker cleared and the retry
/// budget charged. Returns the released rows for re-enqueueing.
pub async fn reclaim_tasks_for_worker(pool: &PgPool, worker_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'PENDING', \
             assigned_worker = NULL, \
             retry_count = retry_count + 1, \
             updated_at = now(), \
             completed_at = NULL \
         WHERE assigned_worker = $1 AND status = 'IN_PROGRESS' \
         RETURNING *",
    )
    .bind(worker_id)
    .fetch_all(pool)
    .await
    .context("failed to reclaim tasks for worker")?;

    Ok(tasks)
}

/// List `IN_PROGRESS` tasks whose last update is older than `age_secs`.
///
/// The sweep uses this to find assignments orphaned by a coordinator
/// restart: their workers are gone from the (volatile) registry, so the
/// per-worker reclaim path never sees them.
pub async fn list_stale_in_progress(pool: &PgPool, age_secs: f64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'IN_PROGRESS' \
           AND updated_at < now() - ($1 * interval '1 second')",
    )
    .bind(age_secs)
    .fetch_all(pool)
    .await
    .context("failed to list stale in-progress tasks")?;

    Ok(tasks)
}

/// Move a task to the terminal `FAILED` status.
///
/// Reached only when a task has failed `max_retries` consecutive
/// dispatches; `FAILED` rows are never re-enqueued.
pub async fn fail_task(pool: &PgPool, id: Uuid) -> Result<()> {
    set_task_status(pool, id, TaskStatus::Failed).await
}
