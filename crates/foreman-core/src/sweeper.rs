//! Liveness sweeper: evicts dead workers and reclaims their tasks.
//!
//! Runs every half liveness window. A worker that has gone quiet for twice
//! the window is dropped from the registry, and every `IN_PROGRESS` task
//! still assigned to it goes back to `PENDING` and the ready queue. The
//! same pass also recovers assignments orphaned by a coordinator restart:
//! the registry is volatile, so an `IN_PROGRESS` row whose worker never
//! re-registered would otherwise be stuck forever.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_db::models::Task;
use foreman_db::queries::tasks as task_db;

use crate::queue::ReadyQueue;
use crate::registry::WorkerRegistry;

/// Run the periodic sweep until `cancel` fires.
pub async fn run_sweeper(
    pool: PgPool,
    queue: Arc<ReadyQueue>,
    registry: Arc<WorkerRegistry>,
    cancel: CancellationToken,
) {
    let interval = registry.heartbeat_timeout() / 2;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }

        for worker_id in registry.sweep() {
            tracing::warn!(worker_id = %worker_id, "evicting dead worker");
            reclaim_for_worker(&pool, &queue, worker_id).await;
        }

        reclaim_orphans(&pool, &queue, &registry).await;
    }
    tracing::info!("sweeper stopped");
}

/// Release a dead worker's in-flight tasks back to the queue, or fail the
/// ones whose retry budget is spent.
async fn reclaim_for_worker(pool: &PgPool, queue: &ReadyQueue, worker_id: Uuid) {
    let released = match task_db::reclaim_tasks_for_worker(pool, worker_id).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(
                worker_id = %worker_id,
                error = %e,
                "failed to reclaim tasks for dead worker"
            );
            return;
        }
    };

    for task in released {
        requeue_or_fail(pool, queue, task, worker_id).await;
    }
}

/// Recover `IN_PROGRESS` rows whose assigned worker is not in the
/// registry at all (typically left behind by a coordinator restart).
///
/// Only rows older than the eviction grace window are touched, so a live
/// worker has ample time to re-register before its assignment is taken
/// away.
async fn reclaim_orphans(pool: &PgPool, queue: &ReadyQueue, registry: &WorkerRegistry) {
    let grace = registry.heartbeat_timeout() * 2;
    let stale = match task_db::list_stale_in_progress(pool, grace.as_secs_f64()).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "failed to list stale in-progress tasks");
            return;
        }
    };
    if stale.is_empty() {
        return;
    }

    let known: HashSet<Uuid> = registry.snapshot().iter().map(|w| w.id).collect();
    for task in stale {
        let Some(worker_id) = task.assigned_worker else {
            continue;
        };
        if known.contains(&worker_id) {
            // The worker is still registered; its eviction (and reclaim)
            // is the liveness check's call, not ours.
            continue;
        }
        tracing::warn!(
            task_id = %task.id,
            worker_id = %worker_id,
            "reclaiming orphaned assignment"
        );
        match task_db::release_task(pool, task.id).await {
            Ok(released) => requeue_or_fail(pool, queue, released, worker_id).await,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "failed to release orphaned task");
            }
        }
    }
}

/// Put a released task back on the queue, or fail it if the budget is
/// spent.
async fn requeue_or_fail(pool: &PgPool, queue: &ReadyQueue, task: Task, worker_id: Uuid) {
    if task.retries_exhausted() {
        tracing::warn!(
            task_id = %task.id,
            retry_count = task.retry_count,
            "retry budget exhausted during reclaim, failing task"
        );
        if let Err(e) = task_db::fail_task(pool, task.id).await {
            tracing::error!(task_id = %task.id, error = %e, "failed to mark task FAILED");
        }
    } else {
        tracing::info!(
            task_id = %task.id,
            worker_id = %worker_id,
            "returning task to queue after worker loss"
        );
        queue.enqueue(&task);
    }
}
