//! # labelq
//!
//! Lease-based work assignment for image labeling, on SQLite.
//!
//! Every image in a source directory becomes an item. Workers reserve one
//! item at a time under a lease token, finish it with labels or a skip, and
//! lose the lease if they go quiet past the timeout. Any number of threads or
//! processes may share one database file; at most one unexpired lease exists
//! per item at any instant.

pub mod catalog;
mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod lifecycle;
pub mod maintenance;
pub mod model;
pub mod storage;
pub mod telemetry;

pub use engine::Engine;
pub use error::{Error, Result};
