// src/orchestrator.rs

//! The orchestrator (C7): drives one or more replication sets end to end —
//! inspecting schema once per set, grouping destinations by starting
//! version, fetching and planning one batch per group, applying it per
//! destination with the two-stage recovery state machine on constraint
//! violations, and leaving a session marker behind so a crash mid-set can
//! resume cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::apply::ChangeApplier;
use crate::change::ChangeSummary;
use crate::config::{Config, DatabaseConfig, DatabaseMode, ReplicationSetConfig};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::fetch::ChangeFetcher;
use crate::plan::FkDeferralPlanner;
use crate::repopulate::RepopulateEngine;
use crate::schema::{self, TableDescriptor};
use crate::session::SessionStore;
use crate::version;

/// Cooperative cancellation, checked between replication sets and once
/// per loop iteration. In-flight batches are never interrupted; a
/// cancelled run still finishes applying the batch it is on, and its
/// transaction commits or rolls back normally.
#[derive(Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitted once per destination per replication set pass, whether or not
/// any rows actually changed.
#[derive(Debug, Clone)]
pub struct SyncedEvent {
    pub replication_set: String,
    pub destination: String,
    pub to_version: i64,
    pub summaries: Vec<ChangeSummary>,
}

/// The result of one `run_once` pass: whether any replication set or
/// destination hit a data error (logged, not propagated), and the final
/// version each destination was synced to.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub any_error: bool,
    pub synced: Vec<(String, i64)>,
}

pub struct Orchestrator {
    session_dir: std::path::PathBuf,
    event_sink: Option<Sender<SyncedEvent>>,
}

impl Orchestrator {
    pub fn new(session_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { session_dir: session_dir.into(), event_sink: None }
    }

    pub fn with_event_sink(mut self, sink: Sender<SyncedEvent>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Run every replication set in `config` once, sequentially. If a
    /// session marker was left behind by a crash mid-set, resume at the
    /// named replication set instead of starting from the top (§4.7
    /// resumability) — sets before it already committed and clearing
    /// their marker, so replaying them would be redundant, not unsafe,
    /// but resuming is what the marker exists for.
    #[instrument(skip(self, config, cancellation))]
    pub fn run_once(&self, config: &Config, cancellation: &CancellationToken) -> RunOutcome {
        let mut outcome = RunOutcome::default();

        let session = SessionStore::in_dir(&self.session_dir);
        let resume_at = match session.read() {
            Ok(Some(marker)) if marker.in_progress => {
                match config.replication_sets.iter().position(|s| s.name == marker.destination_name) {
                    Some(pos) => {
                        info!(
                            replication_set = %marker.destination_name,
                            "resuming from the session marker left by a prior crash"
                        );
                        pos
                    }
                    None => {
                        warn!(
                            replication_set = %marker.destination_name,
                            "session marker names an unknown replication set; starting from the first set"
                        );
                        0
                    }
                }
            }
            Ok(_) => 0,
            Err(e) => {
                warn!(error = %e, "failed to read session marker; starting from the first set");
                0
            }
        };

        for set in &config.replication_sets[resume_at..] {
            if cancellation.is_cancelled() {
                info!("cancellation requested; stopping before next replication set");
                break;
            }
            if let Err(e) = self.run_set(set, &mut outcome) {
                error!(set = %set.name, error = %e, "replication set aborted");
                outcome.any_error = true;
            }
        }
        outcome
    }

    /// Run every replication set repeatedly, sleeping `config.interval`
    /// seconds between passes, until `cancellation` fires.
    pub fn run_loop(&self, config: &Config, cancellation: &CancellationToken) {
        loop {
            let outcome = self.run_once(config, cancellation);
            if outcome.any_error {
                warn!("pass completed with errors; see above");
            }
            if cancellation.is_cancelled() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_secs(config.interval));
            if cancellation.is_cancelled() {
                break;
            }
        }
    }

    #[instrument(skip(self, set, outcome), fields(set = %set.name))]
    fn run_set(&self, set: &ReplicationSetConfig, outcome: &mut RunOutcome) -> Result<()> {
        let session = SessionStore::in_dir(&self.session_dir);
        session.mark_in_progress(&set.name)?;

        let source = Driver::open(&set.source.connection_string)?;
        let table_names = schema::resolve_table_set(source.connection(), &set.tables, &set.exclude_tables)?;
        let mut tables: Vec<TableDescriptor> =
            table_names.iter().map(|n| schema::describe_table(source.connection(), n)).collect::<Result<_>>()?;

        let order = schema::topological_order(&tables)?;
        tables = order.into_iter().map(|i| tables[i].clone()).collect();

        // Bootstrap every destination on its own: open the connection and
        // resolve its starting version per table, repopulating any table
        // that has never been synced here. This first-sync step is
        // inherently per-destination (§4.6); grouping by current version
        // only applies once every destination has a version to group by.
        let mut states: Vec<DestState> = Vec::with_capacity(set.destinations.len());
        for db_config in &set.destinations {
            match self.bootstrap_destination(db_config, &source, &tables) {
                Ok(state) => states.push(state),
                Err(e) => {
                    error!(set = %set.name, destination = %db_config.name, error = %e, "destination sync aborted");
                    outcome.any_error = true;
                }
            }
        }

        // Group the bootstrapped destinations by identical per-table
        // starting versions (§4.7 step 1) and run one shared
        // fetch/plan/apply pass per group, so destinations that are
        // already at the same point in history share a single fetch
        // instead of each re-querying the same change window.
        let mut groups: HashMap<Vec<i64>, Vec<usize>> = HashMap::new();
        for (i, state) in states.iter().enumerate() {
            groups.entry(state.from_versions.clone()).or_default().push(i);
        }
        let mut group_keys: Vec<Vec<i64>> = groups.keys().cloned().collect();
        group_keys.sort();
        for key in group_keys {
            let indices = groups.remove(&key).expect("key came from groups");
            self.run_group(set, &tables, &source, &mut states, &indices, outcome);
        }

        session.clear()?;
        Ok(())
    }

    fn bootstrap_destination<'a>(
        &self,
        db_config: &'a DatabaseConfig,
        source: &Driver,
        tables: &[TableDescriptor],
    ) -> Result<DestState<'a>> {
        let mut driver = Driver::open(&db_config.connection_string)?;
        version::install(driver.connection())?;

        let mut from_versions = Vec::with_capacity(tables.len());
        let mut needs_repopulate = Vec::new();
        for (i, table) in tables.iter().enumerate() {
            match version::current_version(driver.connection(), &table.name)? {
                Some(v) => from_versions.push(v),
                None => {
                    needs_repopulate.push(i);
                    from_versions.push(0);
                }
            }
        }

        if !needs_repopulate.is_empty() {
            if !db_config.populate_out_of_sync {
                let table = &tables[needs_repopulate[0]];
                return Err(Error::HistoryGap { table: table.name.clone(), destination: db_config.name.clone() });
            }
            if db_config.mode == DatabaseMode::Normal {
                let table = &tables[needs_repopulate[0]];
                return Err(Error::RepopulateForbidden { table: table.name.clone(), destination: db_config.name.clone() });
            }
            let engine = RepopulateEngine::new(db_config);
            for &i in &needs_repopulate {
                let inserted = engine.repopulate(source, &mut driver, &tables[i])?;
                info!(table = %tables[i].name, inserted, destination = %db_config.name, "repopulated out-of-sync table");
                from_versions[i] = version::current_version(driver.connection(), &tables[i].name)?.unwrap_or(0);
            }
        }

        Ok(DestState { config: db_config, driver, from_versions, disable_all_constraints: false })
    }

    /// Run the shared fetch/plan/apply loop for one destination-version
    /// group (§4.3, §4.7). `fetcher.fetch` is called once per pass for
    /// the whole group, not once per destination; out-of-sync handling
    /// and the two escalation flags below are likewise decided for the
    /// group as a whole, since they gate what gets fetched next, while
    /// the per-destination `disable_all_constraints` escalation and the
    /// apply itself stay scoped to each destination's own transaction.
    #[instrument(skip(self, set, tables, source, states, indices, outcome), fields(set = %set.name, group_size = indices.len()))]
    fn run_group(
        &self,
        set: &ReplicationSetConfig,
        tables: &[TableDescriptor],
        source: &Driver,
        states: &mut [DestState],
        indices: &[usize],
        outcome: &mut RunOutcome,
    ) {
        let fetcher = ChangeFetcher::new(source);
        let planner = FkDeferralPlanner::new(tables);

        let mut active: Vec<usize> = indices.to_vec();
        // Reset to false at the start of every group (§4.7 step 5).
        let mut use_destination_version_as_min = false;
        let mut ignore_duplicate_key_inserts = false;

        loop {
            if active.is_empty() {
                return;
            }

            let from_versions = states[active[0]].from_versions.clone();
            let info = match fetcher.fetch(tables, &from_versions, None, use_destination_version_as_min) {
                Ok(info) => info,
                Err(e) => {
                    for &di in &active {
                        error!(set = %set.name, destination = %states[di].config.name, error = %e, "fetch failed");
                    }
                    outcome.any_error = true;
                    return;
                }
            };

            if !info.out_of_sync_tables.is_empty() {
                let (opted_in, not_opted): (Vec<usize>, Vec<usize>) =
                    active.iter().copied().partition(|&di| states[di].config.populate_out_of_sync);

                if opted_in.is_empty() {
                    for &di in &active {
                        let table = info.out_of_sync_tables.iter().next().unwrap();
                        error!(
                            set = %set.name, destination = %states[di].config.name, table = %table,
                            "history gap and no destination in this group opted in to repopulation"
                        );
                        outcome.any_error = true;
                    }
                    return;
                }

                for &di in &not_opted {
                    let table = info.out_of_sync_tables.iter().next().unwrap();
                    error!(
                        set = %set.name, destination = %states[di].config.name, table = %table,
                        "history gap; destination did not opt in to repopulation"
                    );
                    outcome.any_error = true;
                }

                let mut still_active = Vec::new();
                for &di in &opted_in {
                    if states[di].config.mode == DatabaseMode::Normal {
                        let table = info.out_of_sync_tables.iter().next().unwrap();
                        error!(
                            set = %set.name, destination = %states[di].config.name, table = %table,
                            "history gap but Normal mode forbids a truncate-based repopulate"
                        );
                        outcome.any_error = true;
                        continue;
                    }

                    let engine = RepopulateEngine::new(states[di].config);
                    let mut failed = false;
                    for table in tables.iter().filter(|t| info.out_of_sync_tables.contains(&t.name)) {
                        if let Err(e) = engine.repopulate(source, &mut states[di].driver, table) {
                            error!(set = %set.name, destination = %states[di].config.name, error = %e, "repopulate failed");
                            outcome.any_error = true;
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        continue;
                    }
                    for (i, table) in tables.iter().enumerate() {
                        states[di].from_versions[i] =
                            version::current_version(states[di].driver.connection(), &table.name).ok().flatten().unwrap_or(0);
                    }
                    still_active.push(di);
                }
                active = still_active;
                continue;
            }

            let mut changes = info.changes;
            planner.plan(&mut changes);

            let mut escalate_group = false;
            for &di in &active {
                loop {
                    let applier =
                        ChangeApplier::new(states[di].config, ignore_duplicate_key_inserts, set.debug_tables);
                    match applier.apply(
                        &mut states[di].driver,
                        &changes,
                        tables,
                        info.to_version,
                        states[di].disable_all_constraints,
                    ) {
                        Ok(summaries) => {
                            info!(
                                set = %set.name, destination = %states[di].config.name,
                                to_version = info.to_version, changes = changes.len(), "destination synced"
                            );
                            if let Some(sink) = &self.event_sink {
                                let _ = sink.send(SyncedEvent {
                                    replication_set: set.name.clone(),
                                    destination: states[di].config.name.clone(),
                                    to_version: info.to_version,
                                    summaries,
                                });
                            }
                            outcome.synced.push((states[di].config.name.clone(), info.to_version));
                            for v in states[di].from_versions.iter_mut() {
                                *v = info.to_version;
                            }
                            // §4.7 step 4: a successful batch clears the
                            // escalation flag, so the next batch for this
                            // destination tries normal per-constraint
                            // deferral again rather than staying wide open.
                            states[di].disable_all_constraints = false;
                            break;
                        }
                        Err(e) if e.is_fk_violation() && !use_destination_version_as_min => {
                            warn!(
                                set = %set.name, destination = %states[di].config.name,
                                "FK violation; retrying the group with destination version as minimum and ignoring duplicate keys"
                            );
                            use_destination_version_as_min = true;
                            ignore_duplicate_key_inserts = true;
                            escalate_group = true;
                            break;
                        }
                        Err(e) if e.is_fk_violation() && !states[di].disable_all_constraints => {
                            warn!(
                                set = %set.name, destination = %states[di].config.name,
                                "FK violation persisted; disabling all constraints for this destination's batch"
                            );
                            states[di].disable_all_constraints = true;
                        }
                        Err(e) if e.is_fk_violation() => {
                            states[di].disable_all_constraints = false;
                            error!(
                                set = %set.name, destination = %states[di].config.name, error = %e,
                                "FK violation persisted even with all constraints disabled"
                            );
                            outcome.any_error = true;
                            break;
                        }
                        Err(e) if e.is_duplicate_key() && !ignore_duplicate_key_inserts => {
                            warn!(
                                set = %set.name, destination = %states[di].config.name,
                                "duplicate key violation; retrying the group with duplicate inserts ignored"
                            );
                            ignore_duplicate_key_inserts = true;
                            escalate_group = true;
                            break;
                        }
                        Err(e) => {
                            error!(set = %set.name, destination = %states[di].config.name, error = %e, "destination sync aborted");
                            outcome.any_error = true;
                            break;
                        }
                    }
                }
                if escalate_group {
                    break;
                }
            }

            if escalate_group {
                continue;
            }
            return;
        }
    }
}

struct DestState<'a> {
    config: &'a DatabaseConfig,
    driver: Driver,
    from_versions: Vec<i64>,
    disable_all_constraints: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, DatabaseMode, ReplicationSetConfig};
    use crate::tracking::{enable, KeyColumn};

    fn fixture_config(source_path: &str, dest_path: &str, populate_out_of_sync: bool) -> Config {
        Config {
            timeout: None,
            interval: 30,
            replication_sets: vec![ReplicationSetConfig {
                name: "main".into(),
                source: DatabaseConfig {
                    name: "source".into(),
                    connection_string: source_path.into(),
                    batch_size: None,
                    populate_out_of_sync: false,
                    mode: DatabaseMode::Normal,
                    table_mapping: vec![],
                    add_row_version_column: false,
                    row_version_column_name: None,
                    disable_all_constraints: false,
                },
                destinations: vec![DatabaseConfig {
                    name: "dest".into(),
                    connection_string: dest_path.into(),
                    batch_size: None,
                    populate_out_of_sync,
                    mode: DatabaseMode::Slave,
                    table_mapping: vec![],
                    add_row_version_column: false,
                    row_version_column_name: None,
                    disable_all_constraints: false,
                }],
                tables: vec![],
                exclude_tables: vec![],
                debug_tables: false,
            }],
        }
    }

    fn seed_source(path: &str) {
        let driver = Driver::open(path).unwrap();
        driver.connection().execute_batch("CREATE TABLE Cust (Id INTEGER PRIMARY KEY, Name TEXT);").unwrap();
        enable(driver.connection(), "Cust", &[KeyColumn { name: "Id".into(), declared_type: "INTEGER".into() }])
            .unwrap();
        driver.connection().execute("INSERT INTO Cust (Id, Name) VALUES (1, 'A')", []).unwrap();
    }

    #[test]
    fn first_run_repopulates_then_incremental_run_applies_changes() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.db");
        let dest_path = dir.path().join("dest.db");
        seed_source(source_path.to_str().unwrap());
        Driver::open(&dest_path)
            .unwrap()
            .connection()
            .execute_batch("CREATE TABLE Cust (Id INTEGER PRIMARY KEY, Name TEXT);")
            .unwrap();

        let config = fixture_config(source_path.to_str().unwrap(), dest_path.to_str().unwrap(), true);
        let orchestrator = Orchestrator::new(dir.path());
        let cancellation = CancellationToken::new();

        let outcome = orchestrator.run_once(&config, &cancellation);
        assert!(!outcome.any_error);

        let dest = Driver::open(&dest_path).unwrap();
        let count: i64 = dest.connection().query_row("SELECT COUNT(*) FROM Cust", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);

        let source = Driver::open(&source_path).unwrap();
        source.connection().execute("INSERT INTO Cust (Id, Name) VALUES (2, 'B')", []).unwrap();
        drop(source);

        let outcome2 = orchestrator.run_once(&config, &cancellation);
        assert!(!outcome2.any_error);
        let count2: i64 = dest.connection().query_row("SELECT COUNT(*) FROM Cust", [], |r| r.get(0)).unwrap();
        assert_eq!(count2, 2);
    }

    #[test]
    fn history_gap_without_populate_out_of_sync_is_reported_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.db");
        let dest_path = dir.path().join("dest.db");
        seed_source(source_path.to_str().unwrap());
        Driver::open(&dest_path)
            .unwrap()
            .connection()
            .execute_batch("CREATE TABLE Cust (Id INTEGER PRIMARY KEY, Name TEXT);")
            .unwrap();

        let config = fixture_config(source_path.to_str().unwrap(), dest_path.to_str().unwrap(), false);
        let orchestrator = Orchestrator::new(dir.path());
        let cancellation = CancellationToken::new();

        let outcome = orchestrator.run_once(&config, &cancellation);
        assert!(outcome.any_error);
    }

    #[test]
    fn normal_mode_destination_refuses_truncate_based_repopulate() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.db");
        let dest_path = dir.path().join("dest.db");
        seed_source(source_path.to_str().unwrap());
        Driver::open(&dest_path)
            .unwrap()
            .connection()
            .execute_batch("CREATE TABLE Cust (Id INTEGER PRIMARY KEY, Name TEXT);")
            .unwrap();

        let mut config = fixture_config(source_path.to_str().unwrap(), dest_path.to_str().unwrap(), true);
        config.replication_sets[0].destinations[0].mode = DatabaseMode::Normal;
        let orchestrator = Orchestrator::new(dir.path());
        let cancellation = CancellationToken::new();

        let outcome = orchestrator.run_once(&config, &cancellation);
        assert!(outcome.any_error, "Normal mode must refuse the truncate-based flush even with opt-in set");
    }

    #[test]
    fn run_once_resumes_from_the_session_marker_left_by_a_prior_crash() {
        let dir = tempfile::tempdir().unwrap();
        let source_a_path = dir.path().join("source_a.db");
        let dest_a_path = dir.path().join("dest_a.db");
        let source_b_path = dir.path().join("source_b.db");
        let dest_b_path = dir.path().join("dest_b.db");

        seed_source(source_a_path.to_str().unwrap());
        seed_source(source_b_path.to_str().unwrap());
        Driver::open(&dest_a_path)
            .unwrap()
            .connection()
            .execute_batch("CREATE TABLE Cust (Id INTEGER PRIMARY KEY, Name TEXT);")
            .unwrap();
        Driver::open(&dest_b_path)
            .unwrap()
            .connection()
            .execute_batch("CREATE TABLE Cust (Id INTEGER PRIMARY KEY, Name TEXT);")
            .unwrap();

        let mut config = fixture_config(source_a_path.to_str().unwrap(), dest_a_path.to_str().unwrap(), true);
        config.replication_sets[0].name = "first".into();
        let second = fixture_config(source_b_path.to_str().unwrap(), dest_b_path.to_str().unwrap(), true);
        let mut second_set = second.replication_sets.into_iter().next().unwrap();
        second_set.name = "second".into();
        config.replication_sets.push(second_set);

        // A prior crash left the marker naming "second" in progress, so a
        // resumed run must skip "first" rather than replay it.
        let session = SessionStore::in_dir(dir.path());
        session.mark_in_progress("second").unwrap();

        let orchestrator = Orchestrator::new(dir.path());
        let outcome = orchestrator.run_once(&config, &CancellationToken::new());
        assert!(!outcome.any_error);
        assert_eq!(outcome.synced.len(), 1, "only the replication set named by the marker should run");

        let dest_a = Driver::open(&dest_a_path).unwrap();
        let count_a: i64 = dest_a.connection().query_row("SELECT COUNT(*) FROM Cust", [], |r| r.get(0)).unwrap();
        assert_eq!(count_a, 0, "the set preceding the marker must be skipped, not replayed");

        let dest_b = Driver::open(&dest_b_path).unwrap();
        let count_b: i64 = dest_b.connection().query_row("SELECT COUNT(*) FROM Cust", [], |r| r.get(0)).unwrap();
        assert_eq!(count_b, 1, "the marked set should still run to completion");
    }
}
