//! Database module for Upwatch.
//!
//! Provides SQLite storage for services, samples, heartbeats, rollup buckets,
//! alert state and the audit log.

mod buckets;
mod models;
pub(crate) mod store;

pub use models::*;
pub use store::*;
