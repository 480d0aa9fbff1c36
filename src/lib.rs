// src/lib.rs

//! Row-level replication engine
//!
//! Replicates row-level changes from one source database to one or more
//! destination databases belonging to the same schema family, using a
//! change-tracking facility that records per-row primary keys plus two
//! monotonic version numbers (last-changed and first-created). Discovers
//! schema, computes per-destination batches, orders and rewrites them for
//! referential integrity, applies them transactionally, and recovers from
//! out-of-range history, foreign-key rejection, and duplicate-key
//! conflicts.
//!
//! # Architecture
//!
//! - `driver`/`tracking`: the database connection and its emulated
//!   change-tracking facility (no native equivalent on the SQLite backend
//!   this crate ships).
//! - `schema`/`version`: what to replicate and where each destination
//!   currently stands.
//! - `change`/`fetch`/`plan`/`apply`: the per-batch pipeline — fetch net
//!   changes, defer foreign keys whose target isn't visible yet, apply
//!   transactionally.
//! - `repopulate`: full reseed when a destination's history has gone out
//!   of range.
//! - `orchestrator`: ties the above into a runnable replication pass,
//!   with recovery and session resumability.

pub mod apply;
pub mod change;
pub mod config;
pub mod driver;
mod error;
pub mod fetch;
pub mod orchestrator;
pub mod plan;
pub mod repopulate;
pub mod schema;
pub mod session;
pub mod tracking;
pub mod value;
pub mod version;

pub use error::{Error, Result};
