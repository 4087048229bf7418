//! Process-wide database access point.
//!
//! # Responsibility
//! - Own the single connection handle for the application's database file.
//! - Run pending migrations once, at initialization, before serving any caller.
//! - Re-expose executor operations bound to the owned handle.
//!
//! # Invariants
//! - Initialization holds the state write lock, so no caller reaches the
//!   database until migrations reach `Done` or `Failed`.
//! - A facade that is not `Ready` refuses every operation with `NotReady` or `Closed`.
//! - `initialize` on a ready facade fails with `AlreadyInitialized`; it never
//!   reconnects or migrates a second database.
//! - A failed initialization may be retried; a closed facade stays closed.
//!
//! Construct one `Database` at process start and share it (for example via
//! `Arc<Database>`) with every consumer.

use crate::config::DatabaseConfig;
use crate::db::migrations::{MigrationReport, MigrationRunner, MigrationStep};
use crate::db::{
    self, ledger, open_db, DbError, DbHandle, DbResult, QueryRow, SqlStatement, SqlValue,
};
use log::{error, info, warn};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Instant;

#[derive(Debug)]
enum FacadeState {
    Uninitialized,
    Ready(ReadyState),
    Failed(String),
    Closed,
}

#[derive(Debug)]
struct ReadyState {
    handle: DbHandle,
    migration: MigrationReport,
}

/// Owning context for the application's database.
#[derive(Debug)]
pub struct Database {
    state: RwLock<FacadeState>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Creates an uninitialized facade.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FacadeState::Uninitialized),
        }
    }

    /// Opens `dir/file_name` with default settings and applies `steps`.
    pub fn initialize_at(
        &self,
        dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
        steps: Vec<MigrationStep>,
    ) -> DbResult<MigrationReport> {
        self.initialize(&DatabaseConfig::new(dir, file_name), steps)
    }

    /// Opens the configured database and runs every pending migration.
    ///
    /// # Errors
    /// - Migration configuration errors, before any file is touched.
    /// - `DbError::Open` / `DbError::AlreadyOpen` when the file cannot be opened.
    /// - `DbError::Transaction` / `DbError::UnsupportedSchemaVersion` from the runner.
    /// - `DbError::AlreadyInitialized` when the facade is already ready.
    /// - `DbError::Closed` after `close`.
    ///
    /// On any error other than `AlreadyInitialized` and `Closed` the facade is
    /// left in a failed state and the handle (if any) is released.
    pub fn initialize(
        &self,
        config: &DatabaseConfig,
        steps: Vec<MigrationStep>,
    ) -> DbResult<MigrationReport> {
        let started_at = Instant::now();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        match &*state {
            FacadeState::Ready(ready) => {
                let path = ready
                    .handle
                    .path()
                    .map_or_else(|| config.full_path(), Path::to_path_buf);
                warn!(
                    "event=facade_init module=facade status=error error_code=already_initialized"
                );
                return Err(DbError::AlreadyInitialized(path));
            }
            FacadeState::Closed => return Err(DbError::Closed),
            FacadeState::Uninitialized | FacadeState::Failed(_) => {}
        }

        info!("event=facade_init module=facade status=start");
        match bootstrap(config, steps) {
            Ok(ready) => {
                let report = ready.migration.clone();
                info!(
                    "event=facade_init module=facade status=ok version={} applied={} duration_ms={}",
                    report.to_version,
                    report.applied.len(),
                    started_at.elapsed().as_millis()
                );
                *state = FacadeState::Ready(ready);
                Ok(report)
            }
            Err(err) => {
                error!(
                    "event=facade_init module=facade status=error duration_ms={} error_code={} error={}",
                    started_at.elapsed().as_millis(),
                    err.code(),
                    err
                );
                *state = FacadeState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.read_state(), FacadeState::Ready(_))
    }

    /// Path of the open database file, when ready.
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.read_state() {
            FacadeState::Ready(ready) => ready.handle.path().map(Path::to_path_buf),
            _ => None,
        }
    }

    /// Report of the migration run performed by `initialize`.
    pub fn migration_report(&self) -> Option<MigrationReport> {
        match &*self.read_state() {
            FacadeState::Ready(ready) => Some(ready.migration.clone()),
            _ => None,
        }
    }

    /// Current ledger version of the owned database.
    pub fn schema_version(&self) -> DbResult<u32> {
        self.with_handle(|handle| handle.with_conn(|conn| ledger::read_version(conn)))
    }

    /// See [`db::execute_update`]; returns `false` when not ready.
    pub fn execute_update(&self, sql: &str, params: &[SqlValue]) -> bool {
        match self.with_handle(|handle| Ok(db::execute_update(handle, sql, params))) {
            Ok(completed) => completed,
            Err(err) => {
                warn!(
                    "event=execute_update module=facade status=error error_code={}",
                    err.code()
                );
                false
            }
        }
    }

    /// See [`db::try_execute_update`].
    pub fn try_execute_update(&self, sql: &str, params: &[SqlValue]) -> DbResult<usize> {
        self.with_handle(|handle| db::try_execute_update(handle, sql, params))
    }

    /// See [`db::execute_query`].
    pub fn execute_query(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<QueryRow>> {
        self.with_handle(|handle| db::execute_query(handle, sql, params))
    }

    /// See [`db::execute_in_transaction`]; returns `false` when not ready.
    pub fn execute_in_transaction(&self, statements: &[SqlStatement]) -> bool {
        match self.with_handle(|handle| Ok(db::execute_in_transaction(handle, statements))) {
            Ok(completed) => completed,
            Err(err) => {
                warn!(
                    "event=execute_transaction module=facade status=error error_code={}",
                    err.code()
                );
                false
            }
        }
    }

    /// See [`db::try_execute_in_transaction`].
    pub fn try_execute_in_transaction(&self, statements: &[SqlStatement]) -> DbResult<()> {
        self.with_handle(|handle| db::try_execute_in_transaction(handle, statements))
    }

    /// Raw connection access for call sites that need rusqlite directly.
    ///
    /// Runs under the same lock as the executor operations. Prefer the
    /// executor methods; writes made here bypass the migration ledger.
    ///
    /// The handle lock is not reentrant: calling back into this `Database`
    /// from inside `f` deadlocks.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> DbResult<T>,
    ) -> DbResult<T> {
        self.with_handle(|handle| handle.with_conn(f))
    }

    /// Closes the owned handle. Idempotent; the facade refuses work afterwards.
    pub fn close(&self) -> DbResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let FacadeState::Ready(ready) = &*state {
            ready.handle.close()?;
        }
        *state = FacadeState::Closed;
        info!("event=facade_close module=facade status=ok");
        Ok(())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, FacadeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_handle<T>(&self, f: impl FnOnce(&DbHandle) -> DbResult<T>) -> DbResult<T> {
        match &*self.read_state() {
            FacadeState::Ready(ready) => f(&ready.handle),
            FacadeState::Uninitialized => {
                Err(DbError::NotReady("database has not been initialized".to_string()))
            }
            FacadeState::Failed(reason) => Err(DbError::NotReady(format!(
                "initialization failed: {reason}"
            ))),
            FacadeState::Closed => Err(DbError::Closed),
        }
    }
}

fn bootstrap(config: &DatabaseConfig, steps: Vec<MigrationStep>) -> DbResult<ReadyState> {
    let mut runner = MigrationRunner::new(steps)?;
    let handle = open_db(config)?;
    // On error `handle` drops here, closing the connection.
    let migration = runner.run(&handle)?;
    Ok(ReadyState { handle, migration })
}
