// src/error.rs

//! Error types for the replication engine.
//!
//! The engine never crashes on data errors (out-of-range history, FK
//! rejection, duplicate keys): those are logged and folded into the
//! boolean error flag returned from the orchestrator's entry points. The
//! variants here exist for the handful of conditions that genuinely abort
//! a replication set or a destination group, plus config/session I/O.

use thiserror::Error;

/// Core error types for the replication engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Driver-level error (connection, statement, constraint violation, ...).
    #[error("database driver error: {0}")]
    Driver(#[from] rusqlite::Error),

    /// I/O error (session marker file, database file paths).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or incomplete configuration document.
    #[error("configuration error: {0}")]
    Config(String),

    /// A table in the effective include/exclude set does not have change
    /// tracking enabled. Carries a remediation hint (the DDL an operator
    /// would run) per the inspector's diagnostic contract.
    #[error("table '{table}' is not change-tracked; {hint}")]
    UntrackedTable { table: String, hint: String },

    /// The foreign-key graph over the replicated tables contains a cycle;
    /// no valid dependency order exists.
    #[error("foreign-key graph contains a cycle: {0}")]
    SchemaCycle(String),

    /// The source's retained history for a table is older than what the
    /// destination needs, and no destination in the group opted into
    /// repopulation.
    #[error("history gap for table '{table}': destination '{destination}' is out of range")]
    HistoryGap { table: String, destination: String },

    /// `PopulateOutOfSync` is set but the destination's `Mode` is
    /// `Normal`, which forbids truncate-based flushes (§6); the history
    /// gap is reported the same as if no opt-in had been given at all.
    #[error(
        "table '{table}' needs a truncate-based repopulate but destination '{destination}' is in Normal mode, which forbids it"
    )]
    RepopulateForbidden { table: String, destination: String },

    /// Catch-all for driver/application errors that are logged and folded
    /// into the caller's error flag rather than propagated.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using the engine's `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True if this error represents a foreign-key constraint violation at
    /// apply time (SQL Server error 547; mapped here from SQLite's
    /// `SQLITE_CONSTRAINT_FOREIGNKEY`).
    pub fn is_fk_violation(&self) -> bool {
        match self {
            Error::Driver(e) => crate::driver::classify_fk_violation(e),
            _ => false,
        }
    }

    /// True if this error represents a duplicate-key violation on insert
    /// (SQL Server error 2627; mapped here from SQLite's
    /// `SQLITE_CONSTRAINT_UNIQUE`/`SQLITE_CONSTRAINT_PRIMARYKEY`).
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Error::Driver(e) => crate::driver::classify_duplicate_key(e),
            _ => false,
        }
    }
}
