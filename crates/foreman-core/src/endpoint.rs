//! Message endpoint: accepts connections and applies decoded frames.
//!
//! One short-lived task per accepted connection: a single read (capped at
//! 4 KiB), one decode, one application against the store / queue /
//! registry, then the connection is dropped. No per-connection state
//! outlives the handler, and a misbehaving client affects nobody else.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_db::models::TaskStatus;
use foreman_db::queries::tasks as task_db;

use crate::protocol::{self, Message, StatusReply};
use crate::queue::ReadyQueue;
use crate::registry::WorkerRegistry;

/// Accept connections until `cancel` fires, spawning one handler per
/// connection.
pub async fn run_acceptor(
    listener: TcpListener,
    pool: PgPool,
    queue: Arc<ReadyQueue>,
    registry: Arc<WorkerRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let pool = pool.clone();
        let queue = Arc::clone(&queue);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &pool, &queue, &registry).await {
                tracing::warn!(peer = %peer, error = %e, "connection handler failed");
            }
        });
    }
    tracing::info!("acceptor stopped");
}

/// Read, decode, and apply a single frame.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: &PgPool,
    queue: &ReadyQueue,
    registry: &WorkerRegistry,
) -> Result<()> {
    let message = protocol::read_frame(&mut stream)
        .await
        .context("failed to decode frame")?;

    match message {
        Message::SubmitTask { task } => {
            let id = task.id.unwrap_or_else(Uuid::new_v4);
            let inserted = task_db::insert_task(pool, id, &task.name, &task.data, task.priority)
                .await
                .context("failed to persist submitted task")?;
            queue.enqueue(&inserted);
            tracing::info!(
                task_id = %inserted.id,
                task_name = %inserted.name,
                priority = inserted.priority,
                "task submitted"
            );
        }
        Message::TaskCompleted { task_id, worker_id } => {
            task_db::complete_task(pool, task_id, worker_id)
                .await
                .context("failed to record task completion")?;
            if !registry.set_available(worker_id, true) {
                tracing::debug!(worker_id = %worker_id, "completion from unregistered worker");
            }
            tracing::info!(task_id = %task_id, worker_id = %worker_id, "task completed");
        }
        Message::Heartbeat {
            worker_id,
            load,
            listen_port,
        } => {
            if !registry.touch(worker_id, load) {
                // First contact: register at the peer's IP and the
                // listening port the worker advertised.
                let address = SocketAddr::new(peer.ip(), listen_port);
                registry.register(worker_id, address);
                tracing::info!(
                    worker_id = %worker_id,
                    address = %address,
                    "worker registered via heartbeat"
                );
            }
        }
        Message::CheckStatus { task_id } => {
            let completed = task_db::get_task(pool, task_id)
                .await
                .context("failed to look up task status")?
                .is_some_and(|t| t.status == TaskStatus::Completed);
            let reply =
                serde_json::to_vec(&StatusReply { completed }).context("failed to encode reply")?;
            stream
                .write_all(&reply)
                .await
                .context("failed to write status reply")?;
            stream.shutdown().await.ok();
        }
        Message::NewTask { .. } => {
            tracing::warn!(peer = %peer, "unexpected new_task frame on coordinator listener");
        }
    }

    Ok(())
}
