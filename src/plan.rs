// src/plan.rs

//! The FK deferral planner (C4): finds changes whose foreign keys point
//! at a row that has not been created yet from the destination's point of
//! view, and marks the constraint to be deferred until that row's own
//! creation version has been applied.

use std::collections::BTreeMap;

use tracing::{instrument, trace};

use crate::change::{Change, Operation};
use crate::schema::TableDescriptor;

/// Computes deferred-constraint annotations over an already-ordered batch
/// of changes.
pub struct FkDeferralPlanner<'a> {
    tables: &'a [TableDescriptor],
}

impl<'a> FkDeferralPlanner<'a> {
    pub fn new(tables: &'a [TableDescriptor]) -> Self {
        Self { tables }
    }

    /// Annotate `changes` in place with deferred foreign keys.
    ///
    /// For every change whose `creation_version < version` (it was
    /// inserted earlier in this same batch and is now being updated) or
    /// whose operation is `Repopulate`, scan forward through the
    /// remaining changes while the candidate's `creation_version <=`
    /// this change's `version`. For each of this change's table's foreign
    /// keys, if the candidate is an Insert or Repopulate of the
    /// referenced table whose key values match the FK's column values,
    /// record `(fk.name, candidate.version)` — keeping the minimum
    /// `until_version` seen per FK name, since multiple candidates can
    /// match the same FK across the scan window.
    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    pub fn plan(&self, changes: &mut [Change]) {
        let needs_scan: Vec<usize> = changes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.creation_version < c.version || matches!(c.operation, Operation::Repopulate))
            .map(|(i, _)| i)
            .collect();

        for i in needs_scan {
            let table = self.table_for(&changes[i].table.name);
            let Some(table) = table else { continue };
            if table.foreign_keys.is_empty() {
                continue;
            }

            let this_version = changes[i].version;
            let mut deferred: BTreeMap<String, i64> = BTreeMap::new();

            for j in (i + 1)..changes.len() {
                let candidate = &changes[j];
                if candidate.creation_version > this_version {
                    break;
                }
                if !matches!(candidate.operation, Operation::Insert | Operation::Repopulate) {
                    continue;
                }

                for fk in &table.foreign_keys {
                    if candidate.table.name != fk.references_table {
                        continue;
                    }
                    if !fk_values_match(&changes[i], candidate, fk) {
                        continue;
                    }
                    let until = candidate.version;
                    deferred
                        .entry(fk.name.clone())
                        .and_modify(|v| *v = (*v).min(until))
                        .or_insert(until);
                }
            }

            if !deferred.is_empty() {
                trace!(table = %changes[i].table.name, key = %changes[i].key_display(), deferred = ?deferred, "deferring constraints");
                changes[i].deferred_fks = deferred;
            }
        }
    }

    fn table_for(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }
}

fn fk_values_match(change: &Change, candidate: &Change, fk: &crate::schema::ForeignKey) -> bool {
    for (owner_col, ref_col) in fk.columns.iter().zip(fk.references_columns.iter()) {
        let owner_val = change.row_values.iter().find(|(n, _)| n == owner_col).map(|(_, v)| v);
        let ref_val = candidate.row_values.iter().find(|(n, _)| n == ref_col).map(|(_, v)| v);
        match (owner_val, ref_val) {
            (Some(a), Some(b)) if a == b => continue,
            _ => return false,
        }
    }
    true
}
