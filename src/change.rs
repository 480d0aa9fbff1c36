// src/change.rs

//! The row-level change record shared by every stage of the pipeline:
//! fetched off the source by `crate::fetch`, annotated with deferred
//! constraints by `crate::plan`, and turned into statements by
//! `crate::apply`.

use std::cmp::Ordering;

use crate::schema::TableDescriptor;
use crate::value::Value;

/// The kind of change a row underwent, net of any intermediate operations
/// collapsed by the change-tracking facility.
///
/// `Repopulate` is not a tracked-change kind at all — it marks rows
/// produced by the flush/repopulate engine (`crate::repopulate`) rather
/// than by incremental fetch, so the planner and applier can tell the two
/// apart without a separate code path end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Repopulate,
}

impl Operation {
    /// Ordering weight used when two changes share the same
    /// `(creation_version, dependency_order)`: deletes sort last (leaf
    /// rows vanish before their parents), updates sort before inserts so
    /// that a replayed update never races ahead of the insert it depends
    /// on inside the same apply batch. This is an explicit total order,
    /// not `derive(Ord)`, because the default declaration order
    /// (Insert, Update, Delete, Repopulate) does not match the order
    /// rows must be applied in.
    fn apply_rank(self) -> u8 {
        match self {
            Operation::Update => 0,
            Operation::Insert => 1,
            Operation::Repopulate => 1,
            Operation::Delete => 2,
        }
    }
}

/// A single net row-level change ready to be planned and applied.
#[derive(Debug, Clone)]
pub struct Change {
    pub table: TableDescriptor,
    pub key_values: Vec<Value>,
    pub row_values: Vec<(String, Value)>,
    pub operation: Operation,
    /// The version at which this change became visible to the fetch
    /// window (`SYS_CHANGE_VERSION` in the facility this mirrors).
    pub version: i64,
    /// The version at which the row was created. Equal to `version` for
    /// a pure update; strictly less than `version` when the row was
    /// inserted earlier in the same fetch window and then updated again
    /// before the window closed.
    pub creation_version: i64,
    /// Position of `table` in the dependency-respecting output order
    /// computed by `crate::schema::topological_order`. Used as the
    /// secondary sort key so that inserts land in parent-before-child
    /// order and deletes land in child-before-parent order within a
    /// single version.
    pub dependency_order: usize,
    /// Populated by the planner for inserts/updates whose foreign keys
    /// reference a row not yet visible at `version`: constraint name to
    /// the version at which the referenced row becomes visible, i.e. the
    /// point after which the constraint is safe to re-enable.
    pub deferred_fks: std::collections::BTreeMap<String, i64>,
}

impl Change {
    /// The total order changes are applied in: ascending creation
    /// version, then ascending dependency order (parents before
    /// children), then the hardcoded Update-before-Insert-before-Delete
    /// rank for same-batch ties.
    pub fn apply_order_key(&self) -> (i64, usize, u8) {
        (self.creation_version, self.dependency_order, self.operation.apply_rank())
    }

    pub fn key_display(&self) -> String {
        self.key_values
            .iter()
            .map(|v| match v {
                Value::Null => "NULL".to_string(),
                Value::Integer(i) => i.to_string(),
                Value::Real(f) => f.to_string(),
                Value::Text(s) => s.clone(),
                Value::Blob(b) => format!("<{} bytes>", b.len()),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialEq for Change {
    fn eq(&self, other: &Self) -> bool {
        self.table.name == other.table.name && self.key_values == other.key_values
    }
}
impl Eq for Change {}

impl PartialOrd for Change {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Change {
    fn cmp(&self, other: &Self) -> Ordering {
        self.apply_order_key().cmp(&other.apply_order_key())
    }
}

/// Summary counters reported per table per destination at the end of a
/// sync pass (`SyncedEvent` payload, ambient event surface).
#[derive(Debug, Clone, Default)]
pub struct ChangeSummary {
    pub table: String,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl ChangeSummary {
    pub fn record(&mut self, op: Operation) {
        match op {
            Operation::Insert | Operation::Repopulate => self.inserts += 1,
            Operation::Update => self.updates += 1,
            Operation::Delete => self.deletes += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}
