//! Worker node: executes dispatched tasks and reports liveness.
//!
//! A worker mints its own id, binds a listening socket for `new_task`
//! frames, and heartbeats once a second with a synthetic load figure (a
//! random walk, standing in for real utilisation). Task execution is
//! simulated by sleeping for a configurable duration; completion goes back
//! to the coordinator on a fresh connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{self, Message, TaskDescriptor};

/// Worker node configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator endpoint address.
    pub coordinator: SocketAddr,
    /// Port for this worker's own listener. 0 binds an ephemeral port.
    pub listen_port: u16,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Simulated execution time per task.
    pub work_duration: Duration,
}

impl WorkerConfig {
    pub fn new(coordinator: SocketAddr) -> Self {
        Self {
            coordinator,
            listen_port: 0,
            heartbeat_interval: Duration::from_secs(1),
            work_duration: Duration::from_secs(2),
        }
    }
}

/// A running worker node.
pub struct WorkerNode {
    id: Uuid,
    addr: SocketAddr,
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

impl WorkerNode {
    /// Bind the task listener and start the heartbeat and accept loops.
    pub async fn start(config: WorkerConfig) -> Result<Self> {
        let id = Uuid::new_v4();
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .with_context(|| format!("failed to bind worker listener on port {}", config.listen_port))?;
        let addr = listener.local_addr().context("failed to read bound address")?;
        tracing::info!(worker_id = %id, addr = %addr, coordinator = %config.coordinator, "worker started");

        let cancel = CancellationToken::new();
        let config = Arc::new(config);

        let heartbeat = tokio::spawn(run_heartbeat(
            id,
            addr.port(),
            Arc::clone(&config),
            cancel.clone(),
        ));
        let acceptor = tokio::spawn(run_task_loop(id, listener, config, cancel.clone()));

        Ok(Self {
            id,
            addr,
            cancel,
            heartbeat,
            acceptor,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address of the task listener.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.heartbeat.await.context("heartbeat task panicked")?;
        self.acceptor.await.context("accept task panicked")?;
        tracing::info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    /// Run until the token fires, then shut down cleanly.
    pub async fn run_until_cancelled(self, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        self.shutdown().await
    }
}

/// Heartbeat loop: assert liveness and report the synthetic load.
async fn run_heartbeat(
    id: Uuid,
    listen_port: u16,
    config: Arc<WorkerConfig>,
    cancel: CancellationToken,
) {
    let mut load: f32 = 0.0;
    loop {
        // Random walk clamped to [0, 1].
        let step: f32 = rand::random_range(-0.1..=0.1);
        load = (load + step).clamp(0.0, 1.0);

        let frame = Message::Heartbeat {
            worker_id: id,
            load,
            listen_port,
        };
        if let Err(e) = protocol::send_message(config.coordinator, &frame).await {
            tracing::warn!(worker_id = %id, error = %e, "heartbeat send failed");
        } else {
            tracing::debug!(worker_id = %id, load = load as f64, "heartbeat sent");
        }

        tokio::select! {
            _ = tokio::time::sleep(config.heartbeat_interval) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

/// Accept loop: one `new_task` frame per inbound connection.
async fn run_task_loop(
    id: Uuid,
    listener: TcpListener,
    config: Arc<WorkerConfig>,
    cancel: CancellationToken,
) {
    loop {
        let (mut stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "accept failed");
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let task = match protocol::read_frame(&mut stream).await {
            Ok(Message::NewTask { task }) => task,
            Ok(other) => {
                tracing::warn!(worker_id = %id, peer = %peer, "unexpected frame: {other:?}");
                continue;
            }
            Err(e) => {
                tracing::warn!(worker_id = %id, peer = %peer, error = %e, "failed to decode frame");
                continue;
            }
        };

        let config = Arc::clone(&config);
        tokio::spawn(async move {
            process_task(id, task, &config).await;
        });
    }
}

/// Simulate execution, then report completion on a fresh connection.
async fn process_task(worker_id: Uuid, task: TaskDescriptor, config: &WorkerConfig) {
    tracing::info!(
        worker_id = %worker_id,
        task_id = %task.id,
        task_name = %task.name,
        priority = task.priority,
        "processing task"
    );

    tokio::time::sleep(config.work_duration).await;

    let frame = Message::TaskCompleted {
        task_id: task.id,
        worker_id,
    };
    match protocol::send_message(config.coordinator, &frame).await {
        Ok(()) => {
            tracing::info!(worker_id = %worker_id, task_id = %task.id, "task completed");
        }
        Err(e) => {
            tracing::error!(
                worker_id = %worker_id,
                task_id = %task.id,
                error = %e,
                "failed to send completion"
            );
        }
    }
}
