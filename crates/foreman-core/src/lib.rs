//! Coordinator internals for the foreman task-dispatch service.
//!
//! The coordinator couples four pieces: the durable task store
//! (`foreman-db`), the in-memory priority [`queue::ReadyQueue`], the
//! [`registry::WorkerRegistry`] with liveness tracking, and the
//! [`dispatcher`] pump that pairs the two over the JSON [`protocol`].
//! [`coordinator::Coordinator`] owns their lifecycles.
//!
//! The [`worker`] and [`client`] modules are the remote ends of the
//! protocol: a worker node that executes dispatched tasks, and a thin
//! submission client.

pub mod client;
pub mod coordinator;
pub mod dispatcher;
pub mod endpoint;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod sweeper;
pub mod worker;
