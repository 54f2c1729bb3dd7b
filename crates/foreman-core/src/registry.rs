//! Volatile registry of known workers with liveness tracking.
//!
//! Workers mint their own ids and assert them in heartbeats; the first
//! heartbeat from an unknown id registers the worker. Everything here is
//! in-memory: workers re-register simply by heartbeating after a
//! coordinator restart.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// A worker is considered alive while its last heartbeat is younger than
/// this.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// A known worker.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: Uuid,
    /// Address of the worker's listening socket, where `new_task` frames
    /// are delivered.
    pub address: SocketAddr,
    pub available: bool,
    pub last_heartbeat: Instant,
    /// Last reported synthetic load, kept for logging.
    pub load: f32,
}

impl Worker {
    fn is_alive(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) < timeout
    }
}

#[derive(Debug, Default)]
struct Inner {
    workers: Vec<Worker>,
    /// Round-robin position; index of the next slot to inspect.
    cursor: usize,
}

/// Mutex-guarded worker set with a round-robin selection cursor.
///
/// All operations are O(n) over a set sized in the tens; the cursor lives
/// inside the guard so selection and mutation never race.
#[derive(Debug)]
pub struct WorkerRegistry {
    heartbeat_timeout: Duration,
    inner: Mutex<Inner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::with_heartbeat_timeout(HEARTBEAT_TIMEOUT)
    }

    /// Build a registry with a non-default liveness window (tests shrink
    /// it to avoid waiting out the real 30 s).
    pub fn with_heartbeat_timeout(timeout: Duration) -> Self {
        Self {
            heartbeat_timeout: timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Add a worker under its self-asserted id, available and freshly
    /// heartbeaten. Re-registering an existing id is idempotent: the
    /// address is refreshed and the worker returns to availability.
    pub fn register(&self, id: Uuid, address: SocketAddr) {
        let mut inner = self.lock();
        if let Some(worker) = inner.workers.iter_mut().find(|w| w.id == id) {
            worker.address = address;
            worker.available = true;
            worker.last_heartbeat = Instant::now();
            return;
        }
        inner.workers.push(Worker {
            id,
            address,
            available: true,
            last_heartbeat: Instant::now(),
            load: 0.0,
        });
    }

    /// Drop a worker. Returns whether it was present.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.lock();
        let before = inner.workers.len();
        inner.workers.retain(|w| w.id != id);
        let removed = inner.workers.len() != before;
        if removed && !inner.workers.is_empty() {
            inner.cursor %= inner.workers.len();
        }
        removed
    }

    /// Refresh a worker's heartbeat, record its reported load, and return
    /// it to availability. Returns `false` when the id is unknown (the
    /// caller then registers it).
    pub fn touch(&self, id: Uuid, load: f32) -> bool {
        let mut inner = self.lock();
        match inner.workers.iter_mut().find(|w| w.id == id) {
            Some(worker) => {
                worker.last_heartbeat = Instant::now();
                worker.available = true;
                worker.load = load;
                true
            }
            None => false,
        }
    }

    /// Flip a worker's availability. Returns `false` when the id is
    /// unknown.
    pub fn set_available(&self, id: Uuid, available: bool) -> bool {
        let mut inner = self.lock();
        match inner.workers.iter_mut().find(|w| w.id == id) {
            Some(worker) => {
                worker.available = available;
                true
            }
            None => false,
        }
    }

    /// Round-robin selection: starting at the cursor, inspect up to N
    /// slots and return the first worker that is both available and alive,
    /// leaving the cursor just past it. `None` when no worker qualifies.
    pub fn next_available(&self) -> Option<(Uuid, SocketAddr)> {
        let now = Instant::now();
        let timeout = self.heartbeat_timeout;
        let mut inner = self.lock();
        let len = inner.workers.len();
        if len == 0 {
            return None;
        }

        let start = inner.cursor % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let worker = &inner.workers[idx];
            if worker.available && worker.is_alive(timeout, now) {
                let picked = (worker.id, worker.address);
                inner.cursor = (idx + 1) % len;
                return Some(picked);
            }
        }
        None
    }

    /// Evict workers that have not heartbeaten for twice the liveness
    /// window. Returns the evicted ids so the caller can reclaim any tasks
    /// still assigned to them in the store.
    pub fn sweep(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let grace = self.heartbeat_timeout * 2;
        let mut inner = self.lock();
        let mut evicted = Vec::new();
        inner.workers.retain(|w| {
            if now.duration_since(w.last_heartbeat) >= grace {
                evicted.push(w.id);
                false
            } else {
                true
            }
        });
        if !inner.workers.is_empty() {
            inner.cursor %= inner.workers.len();
        } else {
            inner.cursor = 0;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().workers.is_empty()
    }

    /// Copy of the current worker set, for logging and the CLI.
    pub fn snapshot(&self) -> Vec<Worker> {
        self.lock().workers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("worker registry mutex poisoned")
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn register_and_select() {
        let registry = WorkerRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, addr(9001));

        let (picked, picked_addr) = registry.next_available().expect("worker should be picked");
        assert_eq!(picked, id);
        assert_eq!(picked_addr, addr(9001));
    }

    #[test]
    fn register_same_id_is_idempotent() {
        let registry = WorkerRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, addr(9001));
        registry.set_available(id, false);

        // Re-registration refreshes the address and availability.
        registry.register(id, addr(9002));
        assert_eq!(registry.len(), 1);
        let (_, picked_addr) = registry.next_available().expect("worker should be picked");
        assert_eq!(picked_addr, addr(9002));
    }

    #[test]
    fn round_robin_alternates_between_workers() {
        let registry = WorkerRegistry::new();
        let w1 = Uuid::new_v4();
        let w2 = Uuid::new_v4();
        registry.register(w1, addr(9001));
        registry.register(w2, addr(9002));

        let picks: Vec<Uuid> = (0..4)
            .map(|_| registry.next_available().expect("should pick").0)
            .collect();
        assert_eq!(picks, vec![w1, w2, w1, w2]);
    }

    #[test]
    fn skips_unavailable_workers() {
        let registry = WorkerRegistry::new();
        let busy = Uuid::new_v4();
        let free = Uuid::new_v4();
        registry.register(busy, addr(9001));
        registry.register(free, addr(9002));
        registry.set_available(busy, false);

        for _ in 0..3 {
            assert_eq!(registry.next_available().unwrap().0, free);
        }
    }

    #[test]
    fn none_when_all_busy() {
        let registry = WorkerRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, addr(9001));
        registry.set_available(id, false);
        assert!(registry.next_available().is_none());

        registry.set_available(id, true);
        assert!(registry.next_available().is_some());
    }

    #[test]
    fn stale_worker_is_not_selected() {
        let registry = WorkerRegistry::with_heartbeat_timeout(Duration::from_millis(20));
        let id = Uuid::new_v4();
        registry.register(id, addr(9001));

        sleep(Duration::from_millis(30));
        assert!(
            registry.next_available().is_none(),
            "worker past the liveness window must not be selected"
        );

        // A heartbeat restores eligibility.
        assert!(registry.touch(id, 0.5));
        assert!(registry.next_available().is_some());
    }

    #[test]
    fn touch_unknown_worker_reports_false() {
        let registry = WorkerRegistry::new();
        assert!(!registry.touch(Uuid::new_v4(), 0.1));
        assert!(!registry.set_available(Uuid::new_v4(), true));
    }

    #[test]
    fn touch_restores_availability() {
        let registry = WorkerRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, addr(9001));
        registry.set_available(id, false);
        assert!(registry.next_available().is_none());

        registry.touch(id, 0.0);
        assert_eq!(registry.next_available().unwrap().0, id);
    }

    #[test]
    fn sweep_evicts_only_long_dead_workers() {
        let registry = WorkerRegistry::with_heartbeat_timeout(Duration::from_millis(20));
        let dead = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        registry.register(dead, addr(9001));

        // Past the liveness window but short of 2x: not yet evicted.
        sleep(Duration::from_millis(25));
        assert!(registry.sweep().is_empty());
        assert_eq!(registry.len(), 1);

        sleep(Duration::from_millis(25));
        registry.register(fresh, addr(9002));
        let evicted = registry.sweep();
        assert_eq!(evicted, vec![dead]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.next_available().unwrap().0, fresh);
    }

    #[test]
    fn remove_adjusts_selection() {
        let registry = WorkerRegistry::new();
        let w1 = Uuid::new_v4();
        let w2 = Uuid::new_v4();
        registry.register(w1, addr(9001));
        registry.register(w2, addr(9002));

        assert!(registry.remove(w1));
        assert!(!registry.remove(w1));
        for _ in 0..3 {
            assert_eq!(registry.next_available().unwrap().0, w2);
        }
    }
}
