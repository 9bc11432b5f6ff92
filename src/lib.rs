//! Embedded database queue orchestrator.
//!
//! One lead queue per database owns the connection bootstrap, the query cache, and the
//! migration lifecycle, then spreads submitted queries across slow, medium, fast, and
//! cache worker queues. Engines are SQLite, PostgreSQL, MySQL, and DB2, each behind a
//! cargo feature.

pub mod cache;
pub mod config;
pub mod connstring;
pub mod engine;
pub mod error;
pub mod json;
pub mod logging;
pub mod manager;
pub mod migration;
pub mod params;
pub mod pending;
pub mod prelude;
pub mod queue;
pub mod types;

pub use error::DbQueueError;
pub use manager::QueueManager;
