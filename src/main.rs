// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rowsync::config;
use rowsync::orchestrator::{CancellationToken, Orchestrator};
use rowsync::schema;
use tracing::info;

#[derive(Parser)]
#[command(name = "rowsync")]
#[command(author, version, about = "Row-level replication engine for change-tracked databases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured replication set once and exit.
    Run {
        /// Path to the JSON configuration file.
        #[arg(short, long)]
        config: String,
        /// Directory to keep the session marker in.
        #[arg(long, default_value = ".")]
        session_dir: String,
    },
    /// Run every configured replication set repeatedly until interrupted.
    Watch {
        /// Path to the JSON configuration file.
        #[arg(short, long)]
        config: String,
        /// Directory to keep the session marker in.
        #[arg(long, default_value = ".")]
        session_dir: String,
    },
    /// Print the discovered table set for one replication set's source,
    /// for operator troubleshooting.
    Inspect {
        /// Path to the JSON configuration file.
        #[arg(short, long)]
        config: String,
        /// Name of the replication set to inspect.
        #[arg(long)]
        set: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, session_dir } => {
            let config = config::load(&config).context("loading configuration")?;
            let orchestrator = Orchestrator::new(session_dir);
            let cancellation = CancellationToken::new();
            let outcome = orchestrator.run_once(&config, &cancellation);
            for (destination, version) in &outcome.synced {
                info!(destination, version, "synced");
            }
            if outcome.any_error {
                anyhow::bail!("one or more replication sets completed with errors");
            }
            Ok(())
        }
        Commands::Watch { config, session_dir } => {
            let config = config::load(&config).context("loading configuration")?;
            let orchestrator = Orchestrator::new(session_dir);
            let cancellation = CancellationToken::new();
            install_signal_handler(cancellation.clone());
            orchestrator.run_loop(&config, &cancellation);
            Ok(())
        }
        Commands::Inspect { config, set } => {
            let config = config::load(&config).context("loading configuration")?;
            let set_config = config
                .replication_sets
                .iter()
                .find(|s| s.name == set)
                .ok_or_else(|| anyhow::anyhow!("no replication set named '{set}'"))?;

            let source = rowsync::driver::Driver::open(&set_config.source.connection_string)?;
            let table_names =
                schema::resolve_table_set(source.connection(), &set_config.tables, &set_config.exclude_tables)?;
            let mut tables: Vec<_> = table_names
                .iter()
                .map(|n| schema::describe_table(source.connection(), n))
                .collect::<rowsync::Result<_>>()?;
            let order = schema::topological_order(&tables)?;
            tables = order.into_iter().map(|i| tables[i].clone()).collect();

            println!("replication set '{set}': {} table(s)", tables.len());
            for (i, table) in tables.iter().enumerate() {
                let fk_summary: Vec<String> =
                    table.foreign_keys.iter().map(|fk| format!("{} -> {}", fk.name, fk.references_table)).collect();
                println!(
                    "  [{i}] {} (keys: {}, identity: {}){}",
                    table.name,
                    table.key_names().join(", "),
                    table.has_identity,
                    if fk_summary.is_empty() { String::new() } else { format!(", fks: {}", fk_summary.join(", ")) }
                );
            }
            Ok(())
        }
    }
}

/// Install a SIGINT handler that flips `cancellation`. The watch loop
/// checks it between replication sets and once per sleep interval; an
/// in-flight batch is never interrupted mid-transaction.
fn install_signal_handler(cancellation: CancellationToken) {
    ctrlc::set_handler(move || {
        info!("received interrupt signal; will stop after the current replication set");
        cancellation.cancel();
    })
    .expect("failed to install SIGINT handler");
}
