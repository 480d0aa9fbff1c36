// src/schema.rs

//! Schema inspection: discovering which tables are in scope for a
//! replication set, their primary keys and foreign keys, and the
//! dependency order changes must be applied in.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::tracking::{self, KeyColumn};

/// A foreign key from `table` to `references_table`, column-for-column in
/// declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    pub table: String,
    pub references_table: String,
    pub columns: Vec<String>,
    pub references_columns: Vec<String>,
}

/// Everything the engine needs to know about one replicated table.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: String,
    pub key_columns: Vec<KeyColumn>,
    pub foreign_keys: Vec<ForeignKey>,
    /// True if the table has a single `INTEGER PRIMARY KEY` column
    /// (SQLite's rowid alias) — the closest equivalent to an identity
    /// column, used to decide whether `Driver::set_identity_insert` is
    /// meaningful for this table.
    pub has_identity: bool,
    /// True if the table has a `CreatedOn`-named column, used by the
    /// flush/repopulate engine to bias insert order (§4.6).
    pub has_created_on: bool,
}

impl TableDescriptor {
    pub fn key_names(&self) -> Vec<&str> {
        self.key_columns.iter().map(|k| k.name.as_str()).collect()
    }
}

/// Strip the bracket/quote decoration a config file's include/exclude
/// list may carry over from the source system's naming convention
/// (`[dbo].[Customers]`, `"Customers"`), leaving a bare identifier to
/// match against `sqlite_master`.
pub fn strip_brackets(name: &str) -> String {
    name.chars().filter(|c| !matches!(c, '[' | ']' | '"' | '`')).collect()
}

/// List every user table in the database, in `sqlite_master` order.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_rowsync_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |r| r.get(0))?.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Resolve the effective table set for a replication set: every tracked
/// table unless an `include` list narrows it, minus anything named in
/// `exclude`. Names are matched after bracket-stripping on both sides.
pub fn resolve_table_set(
    conn: &Connection,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<String>> {
    let tracked: HashSet<String> = tracking::tracked_tables(conn)?.into_iter().collect();
    let exclude: HashSet<String> = exclude.iter().map(|s| strip_brackets(s)).collect();

    let candidates: Vec<String> = if include.is_empty() {
        tracked.iter().cloned().collect()
    } else {
        include.iter().map(|s| strip_brackets(s)).collect()
    };

    let mut resolved = Vec::new();
    for name in candidates {
        if exclude.contains(&name) {
            continue;
        }
        if !tracked.contains(&name) {
            return Err(Error::UntrackedTable {
                table: name.clone(),
                hint: format!(
                    "enable change tracking on '{name}' before including it in a replication set"
                ),
            });
        }
        resolved.push(name);
    }
    resolved.sort();
    resolved.dedup();
    Ok(resolved)
}

/// Inspect one table's primary key, foreign keys, and identity/CreatedOn
/// markers via SQLite's `PRAGMA` introspection functions.
#[instrument(skip(conn))]
pub fn describe_table(conn: &Connection, table: &str) -> Result<TableDescriptor> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let columns: Vec<(String, String, i64)> = stmt
        .query_map([], |r| Ok((r.get::<_, String>(1)?, r.get::<_, String>(2)?, r.get::<_, i64>(5)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut pk_cols: Vec<(i64, String, String)> =
        columns.iter().filter(|(_, _, pk)| *pk > 0).map(|(n, t, pk)| (*pk, n.clone(), t.clone())).collect();
    pk_cols.sort_by_key(|(pk, _, _)| *pk);
    let key_columns: Vec<KeyColumn> =
        pk_cols.into_iter().map(|(_, name, declared_type)| KeyColumn { name, declared_type }).collect();

    let integer_pk_count =
        columns.iter().filter(|(_, _, pk)| *pk > 0).filter(|(_, t, _)| t.eq_ignore_ascii_case("integer")).count();
    let has_identity = key_columns.len() == 1 && integer_pk_count == 1;
    let has_created_on = columns.iter().any(|(name, _, _)| name.eq_ignore_ascii_case("CreatedOn"));

    let foreign_keys = describe_foreign_keys(conn, table)?;

    Ok(TableDescriptor { name: table.to_string(), key_columns, foreign_keys, has_identity, has_created_on })
}

fn describe_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKey>> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list(\"{table}\")"))?;
    let rows: Vec<(i64, i64, String, String, String)> = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // SQLite reports one row per column of a (possibly composite) FK,
    // sharing an `id`; group them back into a single ForeignKey in
    // declaration order (`seq`), since the FK is unnamed at the SQLite
    // level.
    let mut grouped: HashMap<i64, Vec<(i64, String, String, String)>> = HashMap::new();
    for (id, seq, references_table, from_col, to_col) in rows {
        grouped.entry(id).or_default().push((seq, references_table, from_col, to_col));
    }

    let mut fks = Vec::new();
    let mut ids: Vec<i64> = grouped.keys().copied().collect();
    ids.sort();
    for id in ids {
        let mut parts = grouped.remove(&id).unwrap();
        parts.sort_by_key(|(seq, ..)| *seq);
        let references_table = parts[0].1.clone();
        let columns = parts.iter().map(|(_, _, from, _)| from.clone()).collect();
        let references_columns = parts.iter().map(|(_, _, _, to)| to.clone()).collect();
        fks.push(ForeignKey {
            name: format!("fk_{table}_{id}"),
            table: table.to_string(),
            references_table,
            columns,
            references_columns,
        });
    }
    Ok(fks)
}

/// Compute a dependency-respecting order over `tables` by stable
/// insertion: each table is inserted directly before the leftmost table
/// in the output list that it is referenced by (i.e. before the first
/// table whose foreign keys point at it), or appended to the end if no
/// such table exists yet. This keeps tables with no FK relationship to
/// each other in their original relative order, unlike a plain
/// topological sort, which only constrains what FKs require.
#[instrument(skip(descriptors))]
pub fn topological_order(descriptors: &[TableDescriptor]) -> Result<Vec<usize>> {
    let name_to_idx: HashMap<&str, usize> =
        descriptors.iter().enumerate().map(|(i, d)| (d.name.as_str(), i)).collect();

    // referenced_by[i] = set of indices whose FKs point at table i.
    let mut referenced_by: HashMap<usize, HashSet<usize>> = HashMap::new();
    for (i, d) in descriptors.iter().enumerate() {
        for fk in &d.foreign_keys {
            if let Some(&target) = name_to_idx.get(fk.references_table.as_str()) {
                if target != i {
                    referenced_by.entry(target).or_default().insert(i);
                }
            }
        }
    }

    detect_cycle(descriptors, &name_to_idx)?;

    let mut order: Vec<usize> = Vec::with_capacity(descriptors.len());
    for i in 0..descriptors.len() {
        let dependents = referenced_by.get(&i);
        let insert_at = match dependents {
            None => order.len(),
            Some(deps) => order.iter().position(|&t| deps.contains(&t)).unwrap_or(order.len()),
        };
        order.insert(insert_at, i);
    }

    debug!(order = ?order.iter().map(|&i| &descriptors[i].name).collect::<Vec<_>>(), "computed dependency order");
    Ok(order)
}

fn detect_cycle(descriptors: &[TableDescriptor], name_to_idx: &HashMap<&str, usize>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let n = descriptors.len();
    let mut marks = vec![Mark::Unvisited; n];
    let adj: Vec<Vec<usize>> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| {
            d.foreign_keys
                .iter()
                .filter_map(|fk| name_to_idx.get(fk.references_table.as_str()).copied())
                .filter(|&t| t != i)
                .collect()
        })
        .collect();

    fn visit(
        node: usize,
        adj: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        descriptors: &[TableDescriptor],
    ) -> Result<()> {
        match marks[node] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let cycle_start = stack.iter().position(|&n| n == node).unwrap_or(0);
                let names: Vec<&str> = stack[cycle_start..].iter().map(|&i| descriptors[i].name.as_str()).collect();
                return Err(Error::SchemaCycle(names.join(" -> ")));
            }
            Mark::Unvisited => {}
        }
        marks[node] = Mark::InProgress;
        stack.push(node);
        for &next in &adj[node] {
            visit(next, adj, marks, stack, descriptors)?;
        }
        stack.pop();
        marks[node] = Mark::Done;
        Ok(())
    }

    let mut stack = Vec::new();
    for i in 0..n {
        if marks[i] == Mark::Unvisited {
            visit(i, &adj, &mut marks, &mut stack, descriptors)?;
        }
    }
    Ok(())
}
