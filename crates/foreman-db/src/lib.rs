//! Durable task store for the foreman coordinator.
//!
//! The `tasks` table is the system of record; the in-memory ready queue in
//! `foreman-core` is a derived view rebuilt from [`queries::tasks::list_pending`]
//! on startup.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
