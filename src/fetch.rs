// src/fetch.rs

//! The change fetcher (C3): turns the tracking facility's raw per-table
//! net-change stream into one ordered, ready-to-apply batch for a group of
//! destinations sitting at the same starting version.

use std::collections::BTreeSet;

use tracing::{instrument, warn};

use crate::change::{Change, Operation};
use crate::driver::Driver;
use crate::schema::TableDescriptor;
use crate::tracking;

/// One fetched batch: every change visible between a destination's last
/// synced version and the source's version at fetch time, plus the set of
/// tables whose retained history could not satisfy the request.
#[derive(Debug, Default)]
pub struct ChangeInfo {
    pub to_version: i64,
    pub changes: Vec<Change>,
    /// Tables whose source-side minimum valid version is ahead of the
    /// version a destination asked for — that destination cannot be
    /// synced incrementally and must be repopulated (§4.3/§4.6).
    pub out_of_sync_tables: BTreeSet<String>,
}

/// Fetches and orders net changes for a set of tables, given each table's
/// starting version on the destination.
pub struct ChangeFetcher<'a> {
    source: &'a Driver,
}

impl<'a> ChangeFetcher<'a> {
    pub fn new(source: &'a Driver) -> Self {
        Self { source }
    }

    /// Fetch net changes for every table in `tables` (already in
    /// dependency order; `tables[i]`'s position is its `dependency_order`)
    /// since `from_versions[i]`, capped at `max_version` if given (the
    /// recovery path's replay-window bound, §4.7).
    ///
    /// When `use_destination_version_as_min` is set, a table whose min
    /// valid version is ahead of `from_versions[i]` is not treated as
    /// out-of-sync as long as the destination's own version is still
    /// within range — this implements the orchestrator's first escalation
    /// step on FK violation (§4.7), which re-derives the lower bound from
    /// the destination's reported version rather than failing outright.
    #[instrument(skip(self, tables, from_versions), fields(tables = tables.len()))]
    pub fn fetch(
        &self,
        tables: &[TableDescriptor],
        from_versions: &[i64],
        max_version: Option<i64>,
        use_destination_version_as_min: bool,
    ) -> crate::error::Result<ChangeInfo> {
        let conn = self.source.connection();
        let snapshot = self.source.supports_snapshot()?;

        // §4.3 step 2: under WAL, hold a single deferred read transaction
        // open across every per-table read in this batch so they all see
        // the same snapshot as `to_version`. Without it, a row committed
        // between reading `to_version` and a later table's read would be
        // picked up here but excluded from `to_version`'s accounting,
        // and the version marker write would then advance past it —
        // the row silently skipped forever.
        let read_guard = if snapshot {
            Some(ReadSnapshot::begin(conn)?)
        } else {
            warn!("source connection is not in WAL mode; reads across tables may not be a consistent snapshot");
            None
        };

        let to_version = tracking::current_version(conn)?;
        let mut out_of_sync_tables = BTreeSet::new();
        let mut changes = Vec::new();

        for (dependency_order, (table, &from_version)) in tables.iter().zip(from_versions.iter()).enumerate() {
            let min_valid = tracking::min_valid_version(conn, &table.name)?;
            if min_valid > from_version && !use_destination_version_as_min {
                out_of_sync_tables.insert(table.name.clone());
                continue;
            }
            if min_valid > from_version {
                warn!(table = %table.name, from_version, min_valid, "history gap tolerated via useDestinationVersionAsMin");
            }

            let net = tracking::changes_since(conn, &table.name, &table.key_columns, from_version, max_version)?;
            for nc in net {
                if read_guard.is_none() && nc.version.min(nc.creation_version) > to_version {
                    // No snapshot isolation: this row committed after we
                    // read `to_version` above. Leave it for the next
                    // batch rather than applying it now and advancing
                    // the marker past a version it was never part of.
                    continue;
                }
                let row_values = if matches!(nc.operation, Operation::Delete) {
                    Vec::new()
                } else {
                    read_row(conn, table, &nc.key_values)?
                };
                changes.push(Change {
                    table: table.clone(),
                    key_values: nc.key_values,
                    row_values,
                    operation: nc.operation,
                    version: nc.version,
                    creation_version: nc.creation_version,
                    dependency_order,
                    deferred_fks: Default::default(),
                });
            }
        }

        // Final ordering: creationVersion ASC, dependencyOrder ASC,
        // operation DESC with Update before Insert — exactly `Change::cmp`.
        changes.sort();

        if let Some(guard) = read_guard {
            guard.commit()?;
        }

        Ok(ChangeInfo { to_version, changes, out_of_sync_tables })
    }
}

/// A deferred read transaction held open across every per-table read in
/// one fetch pass, so they all observe the same consistent snapshot
/// (§4.3 step 2). Issued as raw `BEGIN`/`COMMIT` statements rather than
/// `rusqlite::Transaction` because `ChangeFetcher` only holds a shared
/// `&Driver` — this is read-only, so there is nothing to serialize
/// against the `&mut Connection` a real write transaction would need.
/// Rolls back on drop if never committed, so an error partway through a
/// fetch never leaves the connection sitting inside an open transaction.
struct ReadSnapshot<'c> {
    conn: &'c rusqlite::Connection,
    active: bool,
}

impl<'c> ReadSnapshot<'c> {
    fn begin(conn: &'c rusqlite::Connection) -> crate::error::Result<Self> {
        conn.execute_batch("BEGIN DEFERRED TRANSACTION;")?;
        Ok(Self { conn, active: true })
    }

    fn commit(mut self) -> crate::error::Result<()> {
        self.conn.execute_batch("COMMIT;")?;
        self.active = false;
        Ok(())
    }
}

impl Drop for ReadSnapshot<'_> {
    fn drop(&mut self) {
        if self.active {
            let _ = self.conn.execute_batch("ROLLBACK;");
        }
    }
}

fn read_row(
    conn: &rusqlite::Connection,
    table: &TableDescriptor,
    key_values: &[crate::value::Value],
) -> crate::error::Result<Vec<(String, crate::value::Value)>> {
    let key_names = table.key_names();
    let where_clause = key_names.iter().map(|k| format!("\"{k}\" = ?")).collect::<Vec<_>>().join(" AND ");
    let sql = format!("SELECT * FROM \"{}\" WHERE {where_clause}", table.name);

    let mut stmt = conn.prepare(&sql)?;
    let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let params = rusqlite::params_from_iter(key_values.iter());

    let row_values = stmt.query_row(params, |row| {
        let mut values = Vec::with_capacity(col_names.len());
        for i in 0..col_names.len() {
            values.push(row.get::<_, crate::value::Value>(i)?);
        }
        Ok(values)
    })?;

    Ok(col_names.into_iter().zip(row_values).collect())
}
