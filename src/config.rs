// src/config.rs

//! Configuration document: one or more replication sets, each pairing a
//! source database with one or more destinations, loaded from a JSON file
//! on disk.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_interval() -> u64 {
    30
}

fn default_mode() -> DatabaseMode {
    DatabaseMode::Slave
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Per-statement timeout in seconds. Not enforced at the SQLite
    /// backend (rusqlite statements are synchronous and unbounded), kept
    /// so the config surface matches the source system's.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    pub replication_sets: Vec<ReplicationSetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationSetConfig {
    pub name: String,
    pub source: DatabaseConfig,
    pub destinations: Vec<DatabaseConfig>,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    #[serde(default)]
    pub debug_tables: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DatabaseMode {
    Normal,
    Slave,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseConfig {
    pub name: String,
    /// A filesystem path to a SQLite database file, standing in for the
    /// source system's server connection string.
    pub connection_string: String,
    /// Caps how many rows the fetcher would page per query against a
    /// server driver that charges per round trip. The SQLite backend
    /// reads each table's net changes in a single query regardless, so
    /// this is parsed for config-document parity but does not change
    /// fetch behavior here.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub populate_out_of_sync: bool,
    #[serde(default = "default_mode")]
    pub mode: DatabaseMode,
    #[serde(default)]
    pub table_mapping: Vec<TableMapping>,
    /// Whether the destination schema carries a server-maintained
    /// row-version/timestamp column that this engine must leave alone on
    /// writes. SQLite has no such generated-column type, so there is
    /// nothing for the applier to exclude; parsed for parity only.
    #[serde(default)]
    pub add_row_version_column: bool,
    #[serde(default)]
    pub row_version_column_name: Option<String>,
    #[serde(default)]
    pub disable_all_constraints: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TableMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub column_mappings: Vec<ColumnMapping>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

impl DatabaseConfig {
    /// Resolve the destination-side table name for `source_table`,
    /// falling back to the source-side name when no mapping entry
    /// exists — the Open Question resolution recorded in DESIGN.md.
    pub fn map_table<'a>(&'a self, source_table: &'a str) -> &'a str {
        self.table_mapping.iter().find(|m| m.source == source_table).map(|m| m.target.as_str()).unwrap_or(source_table)
    }

    /// Resolve the destination-side column name for `source_table`'s
    /// `source_column`, falling back to the source-side name.
    pub fn map_column<'a>(&'a self, source_table: &str, source_column: &'a str) -> &'a str {
        self.table_mapping
            .iter()
            .find(|m| m.source == source_table)
            .and_then(|m| m.column_mappings.iter().find(|c| c.source == source_column))
            .map(|c| c.target.as_str())
            .unwrap_or(source_column)
    }
}

/// Load a `Config` from a JSON file at `path`, surfacing malformed
/// documents as a descriptive `Error::Config` rather than a panic.
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("failed to parse '{}': {e}", path.display())))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.replication_sets.is_empty() {
        return Err(Error::Config("configuration must define at least one replication set".into()));
    }
    let mut seen_names: HashMap<&str, ()> = HashMap::new();
    for set in &config.replication_sets {
        if set.destinations.is_empty() {
            return Err(Error::Config(format!("replication set '{}' has no destinations", set.name)));
        }
        if seen_names.insert(set.name.as_str(), ()).is_some() {
            return Err(Error::Config(format!("duplicate replication set name '{}'", set.name)));
        }
        for destination in &set.destinations {
            for mapping in &destination.table_mapping {
                if mapping.source.is_empty() || mapping.target.is_empty() {
                    return Err(Error::Config(format!(
                        "replication set '{}' destination '{}' has an empty table mapping entry",
                        set.name, destination.name
                    )));
                }
                for column in &mapping.column_mappings {
                    if column.source.is_empty() || column.target.is_empty() {
                        return Err(Error::Config(format!(
                            "replication set '{}' destination '{}' has an empty column mapping entry for table '{}'",
                            set.name, destination.name, mapping.source
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{
            "Interval": 10,
            "ReplicationSets": [{
                "Name": "main",
                "Source": { "Name": "src", "ConnectionString": "src.db" },
                "Destinations": [{ "Name": "dst", "ConnectionString": "dst.db" }]
            }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.interval, 10);
        assert_eq!(config.replication_sets[0].destinations[0].mode, DatabaseMode::Slave);
    }

    #[test]
    fn rejects_empty_replication_sets() {
        let json = r#"{ "ReplicationSets": [] }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn table_mapping_falls_back_to_source_name() {
        let db = DatabaseConfig {
            name: "dst".into(),
            connection_string: "dst.db".into(),
            batch_size: None,
            populate_out_of_sync: false,
            mode: DatabaseMode::Slave,
            table_mapping: vec![TableMapping {
                source: "Cust".into(),
                target: "Customers".into(),
                column_mappings: vec![ColumnMapping { source: "Nm".into(), target: "Name".into() }],
            }],
            add_row_version_column: false,
            row_version_column_name: None,
            disable_all_constraints: false,
        };
        assert_eq!(db.map_table("Cust"), "Customers");
        assert_eq!(db.map_table("Ord"), "Ord");
        assert_eq!(db.map_column("Cust", "Nm"), "Name");
        assert_eq!(db.map_column("Cust", "Other"), "Other");
    }

    #[test]
    fn rejects_empty_destination_table_mapping_entry() {
        let json = r#"{
            "ReplicationSets": [{
                "Name": "main",
                "Source": { "Name": "src", "ConnectionString": "src.db" },
                "Destinations": [{
                    "Name": "dst",
                    "ConnectionString": "dst.db",
                    "TableMapping": [{ "Source": "", "Target": "Customers" }]
                }]
            }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("table mapping"));
    }

    #[test]
    fn rejects_empty_destination_column_mapping_entry() {
        let json = r#"{
            "ReplicationSets": [{
                "Name": "main",
                "Source": { "Name": "src", "ConnectionString": "src.db" },
                "Destinations": [{
                    "Name": "dst",
                    "ConnectionString": "dst.db",
                    "TableMapping": [{
                        "Source": "Cust",
                        "Target": "Customers",
                        "ColumnMappings": [{ "Source": "Nm", "Target": "" }]
                    }]
                }]
            }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("column mapping"));
    }
}
