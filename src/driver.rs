// src/driver.rs

//! Thin abstraction over the database connection used for both source and
//! destination sides of a replication set.
//!
//! The component design (§4 of the design spec) treats the driver as an
//! external collaborator: something that hands out connections, runs
//! parameterised statements, and provides transactions and snapshot
//! isolation. This module is that collaborator's concrete shape for the
//! SQLite backend this crate ships. Everything above this module (schema
//! inspection, fetching, planning, applying) is written against `Driver`,
//! not against `rusqlite` directly, so only this file would need to change
//! for a different backend.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, trace};

use crate::error::Result;

/// A single database connection plus the bookkeeping this engine needs on
/// top of it (which FK constraints are currently disabled).
pub struct Driver {
    conn: Connection,
    disabled_constraints: HashSet<String>,
    foreign_keys_pragma_on: bool,
}

impl Driver {
    /// Open a connection to a SQLite database file, creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(Self { conn, disabled_constraints: HashSet::new(), foreign_keys_pragma_on: true })
    }

    /// Open an in-memory database, used by tests and by `--config`-less
    /// one-off inspections.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn, disabled_constraints: HashSet::new(), foreign_keys_pragma_on: true })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Whether the connection is in WAL mode, used by the fetcher to decide
    /// whether a consistent snapshot read across tables is available.
    pub fn supports_snapshot(&self) -> Result<bool> {
        let mode: String = self.conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }

    /// Toggle identity-insert mode for a table. Called by the applier and
    /// the repopulate engine around any insert of an explicit-value row
    /// into a table with an identity column (§4.5/§4.6).
    ///
    /// SQLite always permits an explicit value for an `INTEGER PRIMARY KEY`
    /// (rowid alias) column, so there is no session-level toggle to issue
    /// here — this is a no-op on the SQLite backend, kept as a real driver
    /// call (rather than inlined away at the call sites) so a backend that
    /// does need one — `SET IDENTITY_INSERT table ON/OFF` on SQL Server —
    /// has the toggling already wired in at the right places.
    pub fn set_identity_insert(&mut self, table: &str, on: bool) -> Result<()> {
        trace!(table, on, "set_identity_insert (no-op for sqlite backend)");
        Ok(())
    }

    /// Disable a single named foreign-key constraint.
    ///
    /// SQLite only exposes a connection-wide `PRAGMA foreign_keys`, not
    /// per-constraint enforcement, so multiple disabled constraints are
    /// collapsed onto that one pragma: it is turned off on the first
    /// disable and only turned back on once every disabled constraint has
    /// been re-enabled. This preserves the planner's per-FK bookkeeping
    /// (§4.4/§4.5) while mapping it onto what the backend actually offers.
    pub fn disable_constraint(&mut self, name: &str) -> Result<()> {
        if self.disabled_constraints.insert(name.to_string()) && self.foreign_keys_pragma_on {
            debug!(constraint = name, "disabling foreign key enforcement");
            self.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
            self.foreign_keys_pragma_on = false;
        }
        Ok(())
    }

    pub fn enable_constraint(&mut self, name: &str) -> Result<()> {
        self.disabled_constraints.remove(name);
        if self.disabled_constraints.is_empty() && !self.foreign_keys_pragma_on {
            debug!("re-enabling foreign key enforcement");
            self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            self.foreign_keys_pragma_on = true;
        }
        Ok(())
    }

    /// Disable enforcement of every constraint at once (the "disable all
    /// constraints" destination override from §4.5/§4.7).
    pub fn disable_all_constraints(&mut self) -> Result<()> {
        debug!("disabling all foreign key enforcement (global override)");
        self.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        self.foreign_keys_pragma_on = false;
        Ok(())
    }

    pub fn enable_all_constraints(&mut self) -> Result<()> {
        debug!("re-enabling all foreign key enforcement (global override)");
        self.disabled_constraints.clear();
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.foreign_keys_pragma_on = true;
        Ok(())
    }

    pub fn any_constraints_disabled(&self) -> bool {
        !self.disabled_constraints.is_empty() || !self.foreign_keys_pragma_on
    }
}

/// True if `err` is the SQLite spelling of a foreign-key violation — the
/// SQL Server equivalent is error 547.
pub fn classify_fk_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error { code: rusqlite::ErrorCode::ConstraintViolation, extended_code },
            _,
        ) if *extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

/// True if `err` is the SQLite spelling of a duplicate-key violation on
/// insert — the SQL Server equivalent is error 2627.
pub fn classify_duplicate_key(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error { code: rusqlite::ErrorCode::ConstraintViolation, extended_code },
            _,
        ) if *extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || *extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_disable_enable_is_reference_counted() {
        let mut driver = Driver::open_in_memory().unwrap();
        assert!(!driver.any_constraints_disabled());

        driver.disable_constraint("fk_a").unwrap();
        driver.disable_constraint("fk_b").unwrap();
        assert!(driver.any_constraints_disabled());

        driver.enable_constraint("fk_a").unwrap();
        assert!(driver.any_constraints_disabled(), "fk_b still disabled");

        driver.enable_constraint("fk_b").unwrap();
        assert!(!driver.any_constraints_disabled());
    }

    #[test]
    fn disable_all_then_enable_all_clears_named_set() {
        let mut driver = Driver::open_in_memory().unwrap();
        driver.disable_constraint("fk_a").unwrap();
        driver.disable_all_constraints().unwrap();
        driver.enable_all_constraints().unwrap();
        assert!(!driver.any_constraints_disabled());
    }

    #[test]
    fn classify_fk_violation_recognizes_a_real_foreign_key_error() {
        let driver = Driver::open_in_memory().unwrap();
        driver
            .connection()
            .execute_batch(
                "CREATE TABLE Cust (Id INTEGER PRIMARY KEY);
                 CREATE TABLE Ord (Id INTEGER PRIMARY KEY, CustId INTEGER REFERENCES Cust(Id));",
            )
            .unwrap();
        let err = driver.connection().execute("INSERT INTO Ord (Id, CustId) VALUES (1, 999)", []).unwrap_err();
        assert!(classify_fk_violation(&err));
        assert!(!classify_duplicate_key(&err));
    }

    #[test]
    fn classify_duplicate_key_recognizes_a_real_primary_key_error() {
        let driver = Driver::open_in_memory().unwrap();
        driver.connection().execute_batch("CREATE TABLE Cust (Id INTEGER PRIMARY KEY);").unwrap();
        driver.connection().execute("INSERT INTO Cust (Id) VALUES (1)", []).unwrap();
        let err = driver.connection().execute("INSERT INTO Cust (Id) VALUES (1)", []).unwrap_err();
        assert!(classify_duplicate_key(&err));
        assert!(!classify_fk_violation(&err));
    }
}
