//! End-to-end dispatch tests: a real coordinator over real sockets against
//! a temporary database, with in-test fake workers standing in for remote
//! worker processes.
//!
//! Each test creates a unique temporary database inside a shared
//! containerized PostgreSQL instance and drops it on completion.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::time::timeout;
use uuid::Uuid;

use foreman_core::client;
use foreman_core::coordinator::{Coordinator, CoordinatorConfig};
use foreman_core::protocol::{self, Message, TaskDescriptor};
use foreman_db::config::DbConfig;
use foreman_db::models::TaskStatus;
use foreman_db::queries::tasks as task_db;
use foreman_test_utils::{create_test_db, database_url, drop_test_db};

/// Start a coordinator on an ephemeral port against a fresh temp database.
/// Returns the coordinator, a pool for assertions, and the temp db name.
async fn start_coordinator() -> (Coordinator, sqlx::PgPool, String) {
    let (pool, db_name) = create_test_db().await;
    let url = database_url(&db_name).await;

    let mut config = CoordinatorConfig::new(DbConfig::new(url));
    config.port = 0;
    let coordinator = Coordinator::start(config)
        .await
        .expect("coordinator should start");

    (coordinator, pool, db_name)
}

/// Loopback address of a running coordinator (it binds 0.0.0.0).
fn loopback(coordinator: &Coordinator) -> SocketAddr {
    format!("127.0.0.1:{}", coordinator.addr().port())
        .parse()
        .unwrap()
}

/// An in-test worker: a listener plus the protocol calls a real worker
/// node would make.
struct FakeWorker {
    id: Uuid,
    listener: TcpListener,
}

impl FakeWorker {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("fake worker should bind");
        Self {
            id: Uuid::new_v4(),
            listener,
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    async fn heartbeat(&self, coordinator: SocketAddr) {
        protocol::send_message(
            coordinator,
            &Message::Heartbeat {
                worker_id: self.id,
                load: 0.0,
                listen_port: self.port(),
            },
        )
        .await
        .expect("heartbeat should send");
    }

    /// Wait for the coordinator to deliver a `new_task` frame.
    async fn recv_task(&self) -> TaskDescriptor {
        let (mut stream, _) = timeout(Duration::from_secs(10), self.listener.accept())
            .await
            .expect("coordinator should dispatch within 10s")
            .expect("accept should succeed");
        match protocol::read_frame(&mut stream).await.expect("frame should decode") {
            Message::NewTask { task } => task,
            other => panic!("expected new_task, got {other:?}"),
        }
    }

    async fn complete(&self, coordinator: SocketAddr, task_id: Uuid) {
        protocol::send_message(
            coordinator,
            &Message::TaskCompleted {
                task_id,
                worker_id: self.id,
            },
        )
        .await
        .expect("completion should send");
    }
}

/// Poll the store until `predicate` holds for the task, or fail after 10s.
async fn wait_for_task<F>(pool: &sqlx::PgPool, id: Uuid, what: &str, predicate: F)
where
    F: Fn(&foreman_db::models::Task) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = task_db::get_task(pool, id).await.expect("get should succeed") {
            if predicate(&task) {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for task {id}: {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn dispatches_by_priority_and_completes() {
    // Scenario: two tasks of different priority, one worker.
    let (coordinator, pool, db_name) = start_coordinator().await;
    let addr = loopback(&coordinator);

    let a = client::submit_task(addr, "A", "first payload", 5)
        .await
        .expect("submit should succeed");
    let b = client::submit_task(addr, "B", "second payload", 1)
        .await
        .expect("submit should succeed");

    // Both rows persisted as PENDING before any worker exists.
    wait_for_task(&pool, a, "A pending", |t| t.status == TaskStatus::Pending).await;
    wait_for_task(&pool, b, "B pending", |t| t.status == TaskStatus::Pending).await;

    let worker = FakeWorker::bind().await;
    worker.heartbeat(addr).await;

    // Higher priority dispatches first.
    let first = worker.recv_task().await;
    assert_eq!(first.id, a);
    assert_eq!(first.name, "A");
    assert_eq!(first.priority, 5);
    wait_for_task(&pool, a, "A in progress", |t| {
        t.status == TaskStatus::InProgress && t.assigned_worker == Some(worker.id)
    })
    .await;

    worker.complete(addr, first.id).await;

    let second = worker.recv_task().await;
    assert_eq!(second.id, b);
    worker.complete(addr, second.id).await;

    for id in [a, b] {
        wait_for_task(&pool, id, "completed with timestamp", |t| {
            t.status == TaskStatus::Completed
                && t.completed_at.is_some()
                && t.assigned_worker == Some(worker.id)
        })
        .await;
    }

    coordinator.shutdown().await.expect("clean shutdown");
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_waits_until_a_worker_registers() {
    let (coordinator, pool, db_name) = start_coordinator().await;
    let addr = loopback(&coordinator);

    let id = client::submit_task(addr, "lonely", "no workers yet", 1)
        .await
        .expect("submit should succeed");
    wait_for_task(&pool, id, "pending", |t| t.status == TaskStatus::Pending).await;

    // No workers: the task must sit in PENDING.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let task = task_db::get_task(&pool, id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_worker.is_none());

    // Registration via heartbeat unblocks dispatch.
    let worker = FakeWorker::bind().await;
    worker.heartbeat(addr).await;
    let received = worker.recv_task().await;
    assert_eq!(received.id, id);
    wait_for_task(&pool, id, "in progress", |t| t.status == TaskStatus::InProgress).await;

    coordinator.shutdown().await.expect("clean shutdown");
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn equal_priority_tasks_round_robin_across_workers() {
    let (coordinator, pool, db_name) = start_coordinator().await;
    let addr = loopback(&coordinator);

    // Four equal-priority tasks queued before any worker registers.
    let mut submitted = Vec::new();
    for n in 0..4 {
        let id = client::submit_task(addr, &format!("task-{n}"), "x", 1)
            .await
            .expect("submit should succeed");
        submitted.push(id);
        wait_for_task(&pool, id, "pending", |t| t.status == TaskStatus::Pending).await;
    }

    let w1 = FakeWorker::bind().await;
    let w2 = FakeWorker::bind().await;

    // W1 registers first and takes the first task.
    w1.heartbeat(addr).await;
    let t1 = w1.recv_task().await;
    w2.heartbeat(addr).await;
    let t2 = w2.recv_task().await;

    // Completions return each worker to availability for one more task.
    w1.complete(addr, t1.id).await;
    let t3 = w1.recv_task().await;
    w2.complete(addr, t2.id).await;
    let t4 = w2.recv_task().await;
    w1.complete(addr, t3.id).await;
    w2.complete(addr, t4.id).await;

    // Each worker received exactly half of the submissions.
    let w1_tasks = [t1.id, t3.id];
    let w2_tasks = [t2.id, t4.id];
    let mut all: Vec<Uuid> = w1_tasks.iter().chain(w2_tasks.iter()).copied().collect();
    all.sort();
    let mut expected = submitted.clone();
    expected.sort();
    assert_eq!(all, expected, "every task dispatched exactly once");

    for id in submitted {
        wait_for_task(&pool, id, "completed", |t| t.status == TaskStatus::Completed).await;
    }

    coordinator.shutdown().await.expect("clean shutdown");
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn restart_recovers_pending_tasks_in_priority_order() {
    // Seed the store before the coordinator exists, as if a previous
    // coordinator crashed with three tasks still pending.
    let (pool, db_name) = create_test_db().await;
    let url = database_url(&db_name).await;

    let mut seeded = Vec::new();
    for priority in [3, 7, 5] {
        let task = task_db::insert_task(
            &pool,
            Uuid::new_v4(),
            &format!("recovered-{priority}"),
            "x",
            priority,
        )
        .await
        .expect("seed insert should succeed");
        seeded.push(task);
    }

    let mut config = CoordinatorConfig::new(DbConfig::new(url));
    config.port = 0;
    let coordinator = Coordinator::start(config)
        .await
        .expect("coordinator should start");
    let addr = loopback(&coordinator);

    let worker = FakeWorker::bind().await;
    worker.heartbeat(addr).await;

    // Dispatch order follows list_pending: 7, then 5, then 3.
    for expected_priority in [7, 5, 3] {
        let task = worker.recv_task().await;
        assert_eq!(task.priority, expected_priority);
        worker.complete(addr, task.id).await;
    }

    coordinator.shutdown().await.expect("clean shutdown");
    pool.close().await;
    drop_test_db(&db_name).await;
}
