// src/tracking.rs

//! Emulated server-side change-tracking facility.
//!
//! The engine this crate implements is a *client* of a change-tracking
//! facility it does not itself define (see SPEC_FULL.md §1). SQLite has no
//! such built-in facility, so this module provides a minimal, faithful
//! stand-in: a global monotonic version counter, a per-table append-only
//! log of row-level events populated by triggers, and a per-table
//! "currently live creation version" map so net changes can report
//! `creation_version` the same way `CHANGETABLE` does — populated only when
//! the row's creation itself falls inside the version window being asked
//! about.
//!
//! Everything under `crate::schema`, `crate::fetch`, and `crate::version`
//! talks to this module the way it would talk to `CHANGE_TRACKING_*`
//! system functions and `CHANGETABLE` against a real SQL Server source.

use rusqlite::Connection;

use crate::change::Operation;
use crate::error::Result;
use crate::value::Value;

const SEQ_TABLE: &str = "_rowsync_seq";
const REGISTRY_TABLE: &str = "_rowsync_tracked_tables";
const MIN_VALID_TABLE: &str = "_rowsync_min_valid";

fn log_table(table: &str) -> String {
    format!("_rowsync_log_{table}")
}

fn created_table(table: &str) -> String {
    format!("_rowsync_created_{table}")
}

/// A column participating in a tracked table's primary key.
#[derive(Debug, Clone)]
pub struct KeyColumn {
    pub name: String,
    pub declared_type: String,
}

/// Install the facility's own bookkeeping tables. Idempotent.
pub fn install(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {SEQ_TABLE} (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            version INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO {SEQ_TABLE} (id, version) VALUES (1, 0);

        CREATE TABLE IF NOT EXISTS {REGISTRY_TABLE} (
            table_name TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS {MIN_VALID_TABLE} (
            table_name TEXT PRIMARY KEY,
            min_version INTEGER NOT NULL
        );
        "
    ))?;
    Ok(())
}

/// Enable change tracking on `table`, whose primary key is `key_columns`
/// (already ordered). Creates the shadow log/creation tables and the
/// insert/update/delete triggers. Idempotent.
pub fn enable(conn: &Connection, table: &str, key_columns: &[KeyColumn]) -> Result<()> {
    install(conn)?;

    let log = log_table(table);
    let created = created_table(table);
    let key_cols_ddl: String =
        key_columns.iter().map(|k| format!("{} {}", k.name, k.declared_type)).collect::<Vec<_>>().join(", ");
    let key_names: Vec<&str> = key_columns.iter().map(|k| k.name.as_str()).collect();
    let key_cols_csv = key_names.join(", ");
    let key_pk_csv = key_names.join(", ");

    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {log} (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            op TEXT NOT NULL CHECK(op IN ('I', 'U', 'D')),
            {key_cols_ddl}
        );
        CREATE INDEX IF NOT EXISTS idx_{log}_version ON {log}(version);

        CREATE TABLE IF NOT EXISTS {created} (
            {key_cols_ddl},
            creation_version INTEGER NOT NULL,
            PRIMARY KEY ({key_pk_csv})
        );

        INSERT OR IGNORE INTO {REGISTRY_TABLE}(table_name) VALUES ('{table}');
        INSERT OR IGNORE INTO {MIN_VALID_TABLE}(table_name, min_version) VALUES ('{table}', 0);
        "
    ))?;

    let new_cols: String = key_names.iter().map(|k| format!("NEW.{k}")).collect::<Vec<_>>().join(", ");
    let old_cols: String = key_names.iter().map(|k| format!("OLD.{k}")).collect::<Vec<_>>().join(", ");
    let old_where: String =
        key_names.iter().map(|k| format!("{k} = OLD.{k}")).collect::<Vec<_>>().join(" AND ");

    conn.execute_batch(&format!(
        "
        CREATE TRIGGER IF NOT EXISTS _rowsync_trg_{table}_ins AFTER INSERT ON {table} BEGIN
            UPDATE {SEQ_TABLE} SET version = version + 1 WHERE id = 1;
            INSERT INTO {log}(version, op, {key_cols_csv})
                SELECT version, 'I', {new_cols} FROM {SEQ_TABLE} WHERE id = 1;
            INSERT OR REPLACE INTO {created}({key_cols_csv}, creation_version)
                SELECT {new_cols}, version FROM {SEQ_TABLE} WHERE id = 1;
        END;

        CREATE TRIGGER IF NOT EXISTS _rowsync_trg_{table}_upd AFTER UPDATE ON {table} BEGIN
            UPDATE {SEQ_TABLE} SET version = version + 1 WHERE id = 1;
            INSERT INTO {log}(version, op, {key_cols_csv})
                SELECT version, 'U', {new_cols} FROM {SEQ_TABLE} WHERE id = 1;
        END;

        CREATE TRIGGER IF NOT EXISTS _rowsync_trg_{table}_del AFTER DELETE ON {table} BEGIN
            UPDATE {SEQ_TABLE} SET version = version + 1 WHERE id = 1;
            INSERT INTO {log}(version, op, {key_cols_csv})
                SELECT version, 'D', {old_cols} FROM {SEQ_TABLE} WHERE id = 1;
            DELETE FROM {created} WHERE {old_where};
        END;
        "
    ))?;

    Ok(())
}

/// The facility's current global version.
pub fn current_version(conn: &Connection) -> Result<i64> {
    install(conn)?;
    let v: i64 = conn.query_row(&format!("SELECT version FROM {SEQ_TABLE} WHERE id = 1"), [], |r| r.get(0))?;
    Ok(v)
}

/// The oldest version still queryable for `table` (anything older has been
/// truncated from retained history). Defaults to 0 (unbounded history).
pub fn min_valid_version(conn: &Connection, table: &str) -> Result<i64> {
    let v: i64 = conn
        .query_row(&format!("SELECT min_version FROM {MIN_VALID_TABLE} WHERE table_name = ?1"), [table], |r| {
            r.get(0)
        })
        .unwrap_or(0);
    Ok(v)
}

/// Simulate history truncation by raising `table`'s minimum valid version.
/// Used by tests to exercise the history-gap recovery path (§4.3/§4.6).
pub fn truncate_history(conn: &Connection, table: &str, min_version: i64) -> Result<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO {MIN_VALID_TABLE}(table_name, min_version) VALUES (?1, ?2)"),
        rusqlite::params![table, min_version],
    )?;
    Ok(())
}

/// The set of tables that currently have tracking enabled.
pub fn tracked_tables(conn: &Connection) -> Result<Vec<String>> {
    install(conn)?;
    let mut stmt = conn.prepare(&format!("SELECT table_name FROM {REGISTRY_TABLE} ORDER BY table_name"))?;
    let rows = stmt.query_map([], |r| r.get(0))?.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// One net change to a tracked row, as reported by the facility: a single
/// entry per primary key changed since the requested version, collapsed
/// from the raw event log the way `CHANGETABLE` collapses SQL Server's
/// internal tracking data.
#[derive(Debug, Clone)]
pub struct NetChange {
    pub key_values: Vec<Value>,
    pub operation: Operation,
    pub version: i64,
    pub creation_version: i64,
}

/// Query net changes to `table` since `from_version`, optionally bounded
/// above by `max_version` (exclusive) — the `maxVersion` filter used by the
/// recovery path in §4.7.
pub fn changes_since(
    conn: &Connection,
    table: &str,
    key_columns: &[KeyColumn],
    from_version: i64,
    max_version: Option<i64>,
) -> Result<Vec<NetChange>> {
    let log = log_table(table);
    let key_names: Vec<&str> = key_columns.iter().map(|k| k.name.as_str()).collect();
    let select_cols = key_names.iter().map(|k| format!("\"{k}\"")).collect::<Vec<_>>().join(", ");

    let sql = match max_version {
        Some(_) => format!(
            "SELECT version, op, {select_cols} FROM {log} WHERE version > ?1 AND version < ?2 ORDER BY version"
        ),
        None => format!("SELECT version, op, {select_cols} FROM {log} WHERE version > ?1 ORDER BY version"),
    };

    let mut stmt = conn.prepare(&sql)?;
    let n_keys = key_columns.len();

    let rows: Vec<(i64, String, Vec<Value>)> = {
        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(i64, String, Vec<Value>)> {
            let version: i64 = row.get(0)?;
            let op: String = row.get(1)?;
            let mut keys = Vec::with_capacity(n_keys);
            for i in 0..n_keys {
                keys.push(row.get::<_, Value>(2 + i)?);
            }
            Ok((version, op, keys))
        };
        let iter = match max_version {
            Some(max) => stmt.query_map(rusqlite::params![from_version, max], map_row)?,
            None => stmt.query_map(rusqlite::params![from_version], map_row)?,
        };
        iter.collect::<std::result::Result<Vec<_>, _>>()?
    };

    // Fold the raw per-row event stream into net changes, grouped by key.
    // State machine per spec's semantics: an insert immediately followed
    // (within the window) by a delete cancels out entirely; everything
    // else collapses to the most recent operation, with creation_version
    // recorded only while the "currently live" instance of the row was
    // itself created inside this window.
    enum State {
        Created(i64),
        Updated,
        Deleted,
    }

    let mut folded: Vec<(Vec<Value>, State, i64)> = Vec::new();
    let find = |folded: &[(Vec<Value>, State, i64)], keys: &[Value]| {
        folded.iter().position(|(k, _, _)| k == keys)
    };

    for (version, op, keys) in rows {
        let idx = find(&folded, &keys);
        match (idx, op.as_str()) {
            (None, "I") => folded.push((keys, State::Created(version), version)),
            (None, "U") => folded.push((keys, State::Updated, version)),
            (None, "D") => folded.push((keys, State::Deleted, version)),
            (Some(i), "U") => {
                folded[i].2 = version;
                if matches!(folded[i].1, State::Deleted) {
                    // update after delete shouldn't happen; treat defensively as still live.
                    folded[i].1 = State::Updated;
                }
            }
            (Some(i), "D") => {
                match folded[i].1 {
                    State::Created(_) => {
                        // created then destroyed within the window: net no-op.
                        folded.remove(i);
                        continue;
                    }
                    State::Updated | State::Deleted => {
                        folded[i].1 = State::Deleted;
                        folded[i].2 = version;
                    }
                }
            }
            (Some(i), "I") => {
                // deleted (or never seen) then (re)created: net insert.
                folded[i].1 = State::Created(version);
                folded[i].2 = version;
            }
            _ => {}
        }
    }

    let net = folded
        .into_iter()
        .map(|(key_values, state, version)| match state {
            State::Created(creation_version) => {
                NetChange { key_values, operation: Operation::Insert, version, creation_version }
            }
            State::Updated => NetChange { key_values, operation: Operation::Update, version, creation_version: version },
            State::Deleted => NetChange { key_values, operation: Operation::Delete, version, creation_version: version },
        })
        .collect();

    Ok(net)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE Cust (Id INTEGER PRIMARY KEY, Name TEXT);
             CREATE TABLE Ord (Id INTEGER PRIMARY KEY, CustId INTEGER);",
        )
        .unwrap();
        let keys = vec![KeyColumn { name: "Id".into(), declared_type: "INTEGER".into() }];
        enable(&conn, "Cust", &keys).unwrap();
        enable(&conn, "Ord", &keys).unwrap();
        conn
    }

    #[test]
    fn plain_insert_is_net_insert() {
        let conn = setup();
        conn.execute("INSERT INTO Cust (Id, Name) VALUES (1, 'A')", []).unwrap();
        let keys = vec![KeyColumn { name: "Id".into(), declared_type: "INTEGER".into() }];
        let changes = changes_since(&conn, "Cust", &keys, 0, None).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0].operation, Operation::Insert));
        assert_eq!(changes[0].creation_version, changes[0].version);
    }

    #[test]
    fn insert_then_update_keeps_insert_with_earlier_creation_version() {
        let conn = setup();
        conn.execute("INSERT INTO Cust (Id, Name) VALUES (1, 'A')", []).unwrap();
        conn.execute("UPDATE Cust SET Name = 'B' WHERE Id = 1", []).unwrap();
        let keys = vec![KeyColumn { name: "Id".into(), declared_type: "INTEGER".into() }];
        let changes = changes_since(&conn, "Cust", &keys, 0, None).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0].operation, Operation::Insert));
        assert!(changes[0].creation_version < changes[0].version);
    }

    #[test]
    fn insert_then_delete_cancels_out() {
        let conn = setup();
        conn.execute("INSERT INTO Cust (Id, Name) VALUES (1, 'A')", []).unwrap();
        conn.execute("DELETE FROM Cust WHERE Id = 1", []).unwrap();
        let keys = vec![KeyColumn { name: "Id".into(), declared_type: "INTEGER".into() }];
        let changes = changes_since(&conn, "Cust", &keys, 0, None).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn pure_update_has_equal_version_and_creation_version() {
        let conn = setup();
        conn.execute("INSERT INTO Cust (Id, Name) VALUES (1, 'A')", []).unwrap();
        let keys = vec![KeyColumn { name: "Id".into(), declared_type: "INTEGER".into() }];
        let baseline = current_version(&conn).unwrap();
        conn.execute("UPDATE Cust SET Name = 'B' WHERE Id = 1", []).unwrap();
        let changes = changes_since(&conn, "Cust", &keys, baseline, None).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0].operation, Operation::Update));
        assert_eq!(changes[0].creation_version, changes[0].version);
    }

    #[test]
    fn max_version_bound_excludes_later_changes() {
        let conn = setup();
        conn.execute("INSERT INTO Cust (Id, Name) VALUES (1, 'A')", []).unwrap();
        let v1 = current_version(&conn).unwrap();
        conn.execute("INSERT INTO Cust (Id, Name) VALUES (2, 'B')", []).unwrap();
        let keys = vec![KeyColumn { name: "Id".into(), declared_type: "INTEGER".into() }];
        let changes = changes_since(&conn, "Cust", &keys, 0, Some(v1 + 1)).unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn truncate_history_raises_min_valid_version() {
        let conn = setup();
        truncate_history(&conn, "Cust", 50).unwrap();
        assert_eq!(min_valid_version(&conn, "Cust").unwrap(), 50);
    }
}
