// src/repopulate.rs

//! The flush/repopulate engine (C6): when a destination's retained source
//! history cannot satisfy an incremental sync, this truncates the
//! destination table and reseeds it wholesale from the source's current
//! state, then advances the version marker to the source's current
//! version so incremental sync can resume from there.

use tracing::{debug, instrument};

use crate::config::DatabaseConfig;
use crate::driver::Driver;
use crate::error::Result;
use crate::schema::TableDescriptor;
use crate::tracking;
use crate::value::Value;
use crate::version;

pub struct RepopulateEngine<'a> {
    db_config: &'a DatabaseConfig,
}

impl<'a> RepopulateEngine<'a> {
    pub fn new(db_config: &'a DatabaseConfig) -> Self {
        Self { db_config }
    }

    /// Delete every row of `table` on `destination` and reseed it from
    /// `source`, ordered by `CreatedOn` (if the table has one) then by
    /// key columns, all inside one transaction with FK enforcement
    /// dropped for the duration of the flush. Advances the destination's
    /// sync version for this table to the source's current version at
    /// commit.
    #[instrument(skip(self, source, destination, table), fields(table = %table.name))]
    pub fn repopulate(&self, source: &Driver, destination: &mut Driver, table: &TableDescriptor) -> Result<u64> {
        let dest_table = self.db_config.map_table(&table.name);
        let to_version = tracking::current_version(source.connection())?;

        let order_by = if table.has_created_on {
            format!("\"CreatedOn\", {}", table.key_names().iter().map(|k| format!("\"{k}\"")).collect::<Vec<_>>().join(", "))
        } else {
            table.key_names().iter().map(|k| format!("\"{k}\"")).collect::<Vec<_>>().join(", ")
        };

        let select_sql = format!("SELECT * FROM \"{}\" ORDER BY {order_by}", table.name);
        let mut select_stmt = source.connection().prepare(&select_sql)?;
        let column_names: Vec<String> = select_stmt.column_names().iter().map(|s| s.to_string()).collect();
        let rows: Vec<Vec<Value>> = select_stmt
            .query_map([], |row| {
                let mut values = Vec::with_capacity(column_names.len());
                for i in 0..column_names.len() {
                    values.push(row.get::<_, Value>(i)?);
                }
                Ok(values)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        destination.disable_all_constraints()?;
        if table.has_identity {
            destination.set_identity_insert(dest_table, true)?;
        }
        let mut inserted = 0u64;

        {
            let tx = destination.connection_mut().transaction()?;
            tx.execute(&format!("DELETE FROM \"{dest_table}\""), [])?;

            if !rows.is_empty() {
                let mapped_columns: Vec<String> =
                    column_names.iter().map(|c| self.db_config.map_column(&table.name, c).to_string()).collect();
                let placeholders: Vec<String> = (1..=column_names.len()).map(|i| format!("?{i}")).collect();
                let insert_sql = format!(
                    "INSERT INTO \"{dest_table}\" ({}) VALUES ({})",
                    mapped_columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", "),
                    placeholders.join(", ")
                );
                let mut insert_stmt = tx.prepare(&insert_sql)?;
                for row in &rows {
                    insert_stmt.execute(rusqlite::params_from_iter(row.iter()))?;
                    inserted += 1;
                }
            }

            version::set_version(&tx, &table.name, to_version)?;
            tx.commit()?;
        }

        if table.has_identity {
            destination.set_identity_insert(dest_table, false)?;
        }
        destination.enable_all_constraints()?;
        debug!(table = %table.name, inserted, to_version, "repopulated table");
        Ok(inserted)
    }
}
