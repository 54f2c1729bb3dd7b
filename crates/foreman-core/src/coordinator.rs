//! Coordinator supervisor: owns the lifecycles of the store, queue,
//! registry, dispatcher, sweeper, and acceptor.
//!
//! Startup order matters: the store connects and migrates first, the ready
//! queue is primed from its `PENDING` rows, and only then does the
//! listener open and the dispatcher start. Shutdown is cooperative: the
//! cancellation token stops the acceptor and lets the dispatcher drain its
//! current iteration before the pool closes. In-flight assignments stay
//! `IN_PROGRESS` in the store; a later sweep reclaims them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use foreman_db::config::DbConfig;
use foreman_db::pool as db_pool;
use foreman_db::queries::tasks as task_db;

use crate::dispatcher;
use crate::endpoint;
use crate::queue::ReadyQueue;
use crate::registry::{self, WorkerRegistry};
use crate::sweeper;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Port for the message endpoint. 0 binds an ephemeral port.
    pub port: u16,
    pub db: DbConfig,
    /// Worker liveness window; tests shrink it.
    pub heartbeat_timeout: Duration,
}

impl CoordinatorConfig {
    pub const DEFAULT_PORT: u16 = 8080;

    pub fn new(db: DbConfig) -> Self {
        Self {
            port: Self::DEFAULT_PORT,
            db,
            heartbeat_timeout: registry::HEARTBEAT_TIMEOUT,
        }
    }
}

/// A running coordinator.
pub struct Coordinator {
    addr: SocketAddr,
    cancel: CancellationToken,
    acceptor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    pool: PgPool,
}

impl Coordinator {
    /// Initialise the store, prime the queue, bind the listener, and start
    /// the three coordinator activities.
    ///
    /// Errors here are startup failures; the caller aborts the process
    /// with a diagnostic.
    pub async fn start(config: CoordinatorConfig) -> Result<Self> {
        let pool = db_pool::create_pool(&config.db)
            .await
            .context("task store initialisation failed")?;

        if config.db.recreate_schema {
            db_pool::reset_schema(&pool).await?;
        }
        db_pool::run_migrations(&pool, db_pool::default_migrations_path())
            .await
            .context("schema migration failed")?;

        // Rebuild the ready queue from the store: every PENDING row, in
        // dispatch order.
        let queue = Arc::new(ReadyQueue::new());
        let pending = task_db::list_pending(&pool)
            .await
            .context("failed to load pending tasks")?;
        let recovered = pending.len();
        for task in &pending {
            queue.enqueue(task);
        }
        if recovered > 0 {
            tracing::info!(count = recovered, "recovered pending tasks into ready queue");
        }

        let registry = Arc::new(WorkerRegistry::with_heartbeat_timeout(
            config.heartbeat_timeout,
        ));

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("failed to bind endpoint on port {}", config.port))?;
        let addr = listener.local_addr().context("failed to read bound address")?;
        tracing::info!(addr = %addr, "coordinator listening");

        let cancel = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatcher::run_dispatcher(
            pool.clone(),
            Arc::clone(&queue),
            Arc::clone(&registry),
            cancel.clone(),
        ));
        let sweeper = tokio::spawn(sweeper::run_sweeper(
            pool.clone(),
            Arc::clone(&queue),
            Arc::clone(&registry),
            cancel.clone(),
        ));
        let acceptor = tokio::spawn(endpoint::run_acceptor(
            listener,
            pool.clone(),
            queue,
            registry,
            cancel.clone(),
        ));

        Ok(Self {
            addr,
            cancel,
            acceptor,
            dispatcher,
            sweeper,
            pool,
        })
    }

    /// Address the endpoint is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, drain the dispatcher, and close the store pool.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("coordinator shutting down");
        self.cancel.cancel();
        self.acceptor.await.context("acceptor task panicked")?;
        self.dispatcher.await.context("dispatcher task panicked")?;
        self.sweeper.await.context("sweeper task panicked")?;
        self.pool.close().await;
        tracing::info!("coordinator shut down");
        Ok(())
    }

    /// Run until the token fires, then shut down cleanly.
    pub async fn run_until_cancelled(self, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        self.shutdown().await
    }
}
