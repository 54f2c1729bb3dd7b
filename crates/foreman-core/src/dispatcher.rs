//! The dispatch pump: pairs ready tasks with available workers.
//!
//! A single long-running loop; it is the only consumer of the ready queue
//! and the only caller of `WorkerRegistry::next_available`. For every
//! pairing the assignment is persisted *before* the `new_task` frame goes
//! out, so a crash between the two leaves the task `IN_PROGRESS` for the
//! sweep to reclaim rather than dispatched-but-unrecorded.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use foreman_db::models::TaskStatus;
use foreman_db::queries::tasks as task_db;

use crate::protocol::{Message, TaskDescriptor};
use crate::queue::{QueueEntry, ReadyQueue};
use crate::registry::WorkerRegistry;

/// How long the loop sleeps when there is no task or no worker to pair.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Run the dispatch loop until `cancel` fires.
///
/// Per-iteration errors are logged and the loop continues; only
/// cancellation ends it.
pub async fn run_dispatcher(
    pool: PgPool,
    queue: Arc<ReadyQueue>,
    registry: Arc<WorkerRegistry>,
    cancel: CancellationToken,
) {
    tracing::info!("dispatcher started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        if !queue.non_empty() {
            idle(&cancel).await;
            continue;
        }

        let Some((worker_id, worker_addr)) = registry.next_available() else {
            idle(&cancel).await;
            continue;
        };

        // non_empty() is advisory; retry on a lost race.
        let Some(entry) = queue.try_pop() else {
            continue;
        };

        dispatch_one(&pool, &queue, &registry, entry, worker_id, worker_addr).await;
    }
    tracing::info!("dispatcher stopped");
}

/// Attempt one assignment: persist, mark the worker busy, send the frame.
async fn dispatch_one(
    pool: &PgPool,
    queue: &ReadyQueue,
    registry: &WorkerRegistry,
    entry: QueueEntry,
    worker_id: uuid::Uuid,
    worker_addr: std::net::SocketAddr,
) {
    // Fetch the full row; the queue holds only the ordering snapshot.
    let task = match task_db::get_task(pool, entry.id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            tracing::warn!(task_id = %entry.id, "queued task no longer in store, dropping");
            return;
        }
        Err(e) => {
            tracing::error!(task_id = %entry.id, error = %e, "failed to load task, leaving in queue");
            queue.enqueue_entry(entry);
            tokio::time::sleep(IDLE_BACKOFF).await;
            return;
        }
    };

    if task.status != TaskStatus::Pending {
        // Stale entry (e.g. the task was already reclaimed and re-queued
        // under a newer entry).
        tracing::debug!(task_id = %task.id, status = %task.status, "skipping non-pending queue entry");
        return;
    }

    // Persist the assignment before anything touches the wire.
    if let Err(e) = task_db::assign_task(pool, task.id, worker_id, TaskStatus::InProgress).await {
        tracing::error!(
            task_id = %task.id,
            worker_id = %worker_id,
            error = %e,
            "failed to persist assignment, leaving task in queue"
        );
        queue.enqueue_entry(entry);
        tokio::time::sleep(IDLE_BACKOFF).await;
        return;
    }

    registry.set_available(worker_id, false);

    let frame = Message::NewTask {
        task: TaskDescriptor {
            id: task.id,
            name: task.name.clone(),
            data: task.data.clone(),
            priority: task.priority,
        },
    };

    match crate::protocol::send_message(worker_addr, &frame).await {
        Ok(()) => {
            tracing::info!(
                task_id = %task.id,
                task_name = %task.name,
                worker_id = %worker_id,
                worker_addr = %worker_addr,
                "task dispatched"
            );
        }
        Err(e) => {
            tracing::warn!(
                task_id = %task.id,
                worker_id = %worker_id,
                worker_addr = %worker_addr,
                error = %e,
                "send failed, evicting worker"
            );
            registry.remove(worker_id);
            release_after_failed_send(pool, queue, task.id).await;
        }
    }
}

/// Return a task whose `new_task` send failed to `PENDING`, or land it in
/// terminal `FAILED` once the retry budget is gone.
async fn release_after_failed_send(pool: &PgPool, queue: &ReadyQueue, task_id: uuid::Uuid) {
    match task_db::release_task(pool, task_id).await {
        Ok(released) => {
            if released.retries_exhausted() {
                tracing::warn!(
                    task_id = %task_id,
                    retry_count = released.retry_count,
                    max_retries = released.max_retries,
                    "retry budget exhausted, failing task"
                );
                if let Err(e) = task_db::fail_task(pool, task_id).await {
                    tracing::error!(task_id = %task_id, error = %e, "failed to mark task FAILED");
                }
            } else {
                queue.enqueue(&released);
            }
        }
        Err(e) => {
            // The row stays IN_PROGRESS; operator intervention or a later
            // release will recover it.
            tracing::error!(task_id = %task_id, error = %e, "failed to release task after send failure");
        }
    }
}

async fn idle(cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(IDLE_BACKOFF) => {}
        _ = cancel.cancelled() => {}
    }
}
