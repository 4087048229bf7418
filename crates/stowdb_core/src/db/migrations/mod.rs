//! Migration steps and the runner that applies them.
//!
//! # Responsibility
//! - Validate a caller-supplied, ordered list of migration steps.
//! - Apply pending steps one transaction per step, advancing the ledger with each.
//!
//! # Invariants
//! - Step versions start at 1 and are strictly increasing; violations are
//!   reported before the database is read.
//! - A step's SQL and its ledger write commit together or not at all.
//! - The first failing step stops the run; earlier steps stay committed.
//! - Steps at or below the ledger version are never re-applied.

use crate::db::executor::with_transaction;
use crate::db::{ledger, DbError, DbHandle, DbResult};
use log::{error, info};
use rusqlite::Transaction;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::time::Instant;

mod loader;

pub use loader::load_migrations_dir;

/// Rust-coded migration body, for changes awkward to express as plain SQL.
pub type MigrationFn = fn(&Transaction<'_>) -> rusqlite::Result<()>;

#[derive(Clone)]
pub enum MigrationAction {
    /// SQL batches executed in order; each may hold several statements.
    Sql(Vec<String>),
    Code(MigrationFn),
}

impl Debug for MigrationAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql(batches) => f.debug_tuple("Sql").field(&batches.len()).finish(),
            Self::Code(_) => f.write_str("Code"),
        }
    }
}

/// One versioned schema change, moving the database from `version - 1` to `version`.
#[derive(Debug, Clone)]
pub struct MigrationStep {
    pub version: u32,
    pub name: String,
    pub action: MigrationAction,
}

impl MigrationStep {
    pub fn sql(version: u32, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::statements(version, name, vec![sql.into()])
    }

    pub fn statements(version: u32, name: impl Into<String>, statements: Vec<String>) -> Self {
        Self {
            version,
            name: name.into(),
            action: MigrationAction::Sql(statements),
        }
    }

    pub fn code(version: u32, name: impl Into<String>, body: MigrationFn) -> Self {
        Self {
            version,
            name: name.into(),
            action: MigrationAction::Code(body),
        }
    }

    fn apply(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        match &self.action {
            MigrationAction::Sql(batches) => {
                for batch in batches {
                    tx.execute_batch(batch)?;
                }
                Ok(())
            }
            MigrationAction::Code(body) => body(tx),
        }
    }
}

/// Runner lifecycle. `Done` and `Failed` are terminal for one `run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Idle,
    Checking,
    Applying { version: u32 },
    Done { version: u32 },
    Failed { version: u32 },
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
}

/// Read-only view of where a database stands relative to the known steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current_version: u32,
    pub latest_version: u32,
    pub applied: Vec<u32>,
    pub pending: Vec<u32>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug)]
pub struct MigrationRunner {
    steps: Vec<MigrationStep>,
    state: MigrationState,
}

impl MigrationRunner {
    /// Builds a runner after validating step ordering.
    ///
    /// # Errors
    /// - `DbError::InvalidVersion` for version `0` or a version above
    ///   `ledger::MAX_LEDGER_VERSION`.
    /// - `DbError::DuplicateVersion` when a version appears twice.
    /// - `DbError::OutOfOrderVersion` when versions are not ascending.
    pub fn new(steps: Vec<MigrationStep>) -> DbResult<Self> {
        validate_steps(&steps)?;
        Ok(Self {
            steps,
            state: MigrationState::Idle,
        })
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Highest version known to this runner, `0` when no steps are registered.
    pub fn latest_version(&self) -> u32 {
        self.steps.last().map_or(0, |step| step.version)
    }

    /// Reports applied and pending versions without changing the database.
    pub fn status(&self, handle: &DbHandle) -> DbResult<MigrationStatus> {
        let current_version = handle.with_conn(|conn| ledger::read_version(conn))?;
        let (applied, pending): (Vec<u32>, Vec<u32>) = self
            .steps
            .iter()
            .map(|step| step.version)
            .partition(|version| *version <= current_version);

        Ok(MigrationStatus {
            current_version,
            latest_version: self.latest_version(),
            applied,
            pending,
        })
    }

    /// Applies every pending step in ascending order.
    ///
    /// # Errors
    /// - `DbError::UnsupportedSchemaVersion` when the database is ahead of the
    ///   newest known step; nothing is applied.
    /// - `DbError::Transaction` when a step fails; that step is rolled back and
    ///   the ledger stays at the last committed version.
    ///
    /// # Side effects
    /// - Emits `migration_run` and `migration_step` logging events.
    pub fn run(&mut self, handle: &DbHandle) -> DbResult<MigrationReport> {
        let started_at = Instant::now();
        self.state = MigrationState::Checking;

        let current = match handle.with_conn(|conn| ledger::read_version(conn)) {
            Ok(version) => version,
            Err(err) => {
                self.state = MigrationState::Failed { version: 0 };
                return Err(err);
            }
        };
        let latest = self.latest_version();
        // With no steps supplied there is nothing to compare against.
        if !self.steps.is_empty() && current > latest {
            self.state = MigrationState::Failed { version: current };
            let err = DbError::UnsupportedSchemaVersion {
                db_version: current,
                latest_supported: latest,
            };
            error!(
                "event=migration_run module=migration status=error from_version={} latest_version={} error_code={}",
                current,
                latest,
                err.code()
            );
            return Err(err);
        }

        let mut report = MigrationReport {
            from_version: current,
            to_version: current,
            applied: Vec::new(),
        };
        if current >= latest {
            self.state = MigrationState::Done { version: current };
            info!(
                "event=migration_run module=migration status=skip version={}",
                current
            );
            return Ok(report);
        }

        info!(
            "event=migration_run module=migration status=start from_version={} to_version={}",
            current, latest
        );
        for step in self.steps.iter().filter(|step| step.version > current) {
            self.state = MigrationState::Applying {
                version: step.version,
            };

            let step_started_at = Instant::now();
            if let Err(err) = apply_step(handle, step) {
                self.state = MigrationState::Failed {
                    version: step.version,
                };
                error!(
                    "event=migration_step module=migration status=error version={} name={} duration_ms={} error_code={} error={}",
                    step.version,
                    step.name,
                    step_started_at.elapsed().as_millis(),
                    err.code(),
                    err
                );
                return Err(err);
            }

            info!(
                "event=migration_step module=migration status=ok version={} name={} duration_ms={}",
                step.version,
                step.name,
                step_started_at.elapsed().as_millis()
            );
            report.applied.push(step.version);
            report.to_version = step.version;
        }

        self.state = MigrationState::Done {
            version: report.to_version,
        };
        info!(
            "event=migration_run module=migration status=ok from_version={} to_version={} applied={} duration_ms={}",
            report.from_version,
            report.to_version,
            report.applied.len(),
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }
}

fn apply_step(handle: &DbHandle, step: &MigrationStep) -> DbResult<()> {
    let version = step.version;
    with_transaction(handle, |tx| {
        step.apply(tx)
            .map_err(|source| DbError::Transaction { version, source })?;
        ledger::write_version(tx, version)
    })
    .map_err(|err| match err {
        DbError::Sqlite(source) => DbError::Transaction { version, source },
        other => other,
    })
}

fn validate_steps(steps: &[MigrationStep]) -> DbResult<()> {
    let mut seen = HashSet::with_capacity(steps.len());
    for step in steps {
        if step.version == 0 || step.version > ledger::MAX_LEDGER_VERSION {
            return Err(DbError::InvalidVersion(step.version));
        }
        if !seen.insert(step.version) {
            return Err(DbError::DuplicateVersion(step.version));
        }
    }

    for pair in steps.windows(2) {
        if pair[1].version < pair[0].version {
            return Err(DbError::OutOfOrderVersion {
                previous: pair[0].version,
                version: pair[1].version,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db_in_memory;

    fn step(version: u32) -> MigrationStep {
        MigrationStep::sql(
            version,
            format!("create_t{version}"),
            format!("CREATE TABLE t{version} (id INTEGER PRIMARY KEY);"),
        )
    }

    #[test]
    fn new_rejects_duplicate_versions() {
        let err = MigrationRunner::new(vec![step(1), step(2), step(2)]).unwrap_err();
        assert!(matches!(err, DbError::DuplicateVersion(2)), "unexpected error: {err}");
    }

    #[test]
    fn new_reports_non_adjacent_duplicates_as_duplicates() {
        let err = MigrationRunner::new(vec![step(1), step(2), step(1)]).unwrap_err();
        assert!(matches!(err, DbError::DuplicateVersion(1)), "unexpected error: {err}");
    }

    #[test]
    fn new_rejects_descending_versions() {
        let err = MigrationRunner::new(vec![step(1), step(3), step(2)]).unwrap_err();
        match err {
            DbError::OutOfOrderVersion { previous, version } => {
                assert_eq!(previous, 3);
                assert_eq!(version, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(MigrationRunner::new(vec![step(0)]).unwrap_err().is_config_error());
    }

    #[test]
    fn new_rejects_versions_the_ledger_cannot_store() {
        let err = MigrationRunner::new(vec![step(1), step(3_000_000_000)]).unwrap_err();
        assert!(
            matches!(err, DbError::InvalidVersion(3_000_000_000)),
            "unexpected error: {err}"
        );
        assert!(err.is_config_error());

        let runner = MigrationRunner::new(vec![step(ledger::MAX_LEDGER_VERSION)]).unwrap();
        assert_eq!(runner.latest_version(), ledger::MAX_LEDGER_VERSION);
    }

    #[test]
    fn gaps_between_versions_are_allowed() {
        let runner = MigrationRunner::new(vec![step(1), step(5), step(9)]).unwrap();
        assert_eq!(runner.latest_version(), 9);
        assert_eq!(runner.state(), MigrationState::Idle);
    }

    #[test]
    fn empty_runner_finishes_immediately() {
        let handle = open_db_in_memory().unwrap();
        let mut runner = MigrationRunner::new(Vec::new()).unwrap();

        let report = runner.run(&handle).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(runner.state(), MigrationState::Done { version: 0 });
    }

    #[test]
    fn empty_runner_accepts_an_already_migrated_database() {
        let handle = open_db_in_memory().unwrap();
        MigrationRunner::new(vec![step(1), step(2)])
            .unwrap()
            .run(&handle)
            .unwrap();

        let mut runner = MigrationRunner::new(Vec::new()).unwrap();
        let report = runner.run(&handle).unwrap();
        assert_eq!(report.from_version, 2);
        assert_eq!(report.to_version, 2);
        assert!(report.applied.is_empty());
        assert_eq!(runner.state(), MigrationState::Done { version: 2 });
    }

    #[test]
    fn run_ends_in_failed_state_on_bad_step() {
        let handle = open_db_in_memory().unwrap();
        let mut runner = MigrationRunner::new(vec![
            step(1),
            MigrationStep::sql(2, "broken", "CREATE TABLE oops (;"),
            step(3),
        ])
        .unwrap();

        let err = runner.run(&handle).unwrap_err();
        assert!(matches!(err, DbError::Transaction { version: 2, .. }), "unexpected error: {err}");
        assert_eq!(runner.state(), MigrationState::Failed { version: 2 });

        let status = runner.status(&handle).unwrap();
        assert_eq!(status.current_version, 1);
        assert_eq!(status.applied, vec![1]);
        assert_eq!(status.pending, vec![2, 3]);
        assert!(!status.is_up_to_date());
    }

    #[test]
    fn code_steps_run_inside_the_step_transaction() {
        fn seed(tx: &Transaction<'_>) -> rusqlite::Result<()> {
            tx.execute("INSERT INTO t1 (id) VALUES (?1);", [7])?;
            Ok(())
        }

        let handle = open_db_in_memory().unwrap();
        let mut runner =
            MigrationRunner::new(vec![step(1), MigrationStep::code(2, "seed", seed)]).unwrap();

        let report = runner.run(&handle).unwrap();
        assert_eq!(report.applied, vec![1, 2]);
        let count: i64 = handle
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t1;", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }
}
