// src/version.rs

//! Per-destination version bookkeeping: what version of the source each
//! destination has been synchronized up to, for each replicated table.
//!
//! The facility this mirrors keeps this on the destination side as a
//! small `SyncInfo`-style table so a sync run can resume exactly where
//! the previous one left off, per table, independent of the other tables
//! in the same replication set.

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::Result;

const SYNC_INFO_TABLE: &str = "_rowsync_sync_info";

/// Create the bookkeeping table on a destination connection if absent.
pub fn install(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {SYNC_INFO_TABLE} (
            table_name TEXT PRIMARY KEY,
            last_synced_version INTEGER NOT NULL
        );"
    ))?;
    Ok(())
}

/// The last version of `table` this destination has synchronized to, or
/// `None` if the table has never been synced here (forces a full
/// repopulate before incremental sync can begin, per §4.6).
pub fn current_version(conn: &Connection, table: &str) -> Result<Option<i64>> {
    install(conn)?;
    let version = conn
        .query_row(
            &format!("SELECT last_synced_version FROM {SYNC_INFO_TABLE} WHERE table_name = ?1"),
            [table],
            |r| r.get(0),
        )
        .optional()?;
    Ok(version)
}

/// Record that `table` has been synchronized up to `version` on this
/// destination. Must run inside the same transaction as the batch of
/// changes it follows, so a crash mid-apply can never leave the marker
/// ahead of the data it describes.
pub fn set_version(conn: &Connection, table: &str, version: i64) -> Result<()> {
    debug!(table, version, "advancing destination sync version");
    conn.execute(
        &format!(
            "INSERT INTO {SYNC_INFO_TABLE} (table_name, last_synced_version) VALUES (?1, ?2)
             ON CONFLICT(table_name) DO UPDATE SET last_synced_version = excluded.last_synced_version"
        ),
        rusqlite::params![table, version],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsynced_table_has_no_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn, "Cust").unwrap(), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        set_version(&conn, "Cust", 42).unwrap();
        assert_eq!(current_version(&conn, "Cust").unwrap(), Some(42));
    }

    #[test]
    fn set_version_overwrites_previous_value() {
        let conn = Connection::open_in_memory().unwrap();
        set_version(&conn, "Cust", 1).unwrap();
        set_version(&conn, "Cust", 2).unwrap();
        assert_eq!(current_version(&conn, "Cust").unwrap(), Some(2));
    }
}
