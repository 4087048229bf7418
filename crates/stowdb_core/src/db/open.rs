//! Connection handle lifecycle for SQLite.
//!
//! # Responsibility
//! - Create/open file or in-memory SQLite connections.
//! - Configure connection pragmas required by the executor and runner.
//! - Serialize all access to one connection behind a mutex.
//!
//! # Invariants
//! - At most one open handle per canonical file path per process.
//! - Returned handles have `foreign_keys` and busy timeout configured.
//! - `close` is idempotent; a closed handle rejects further work with `DbError::Closed`.

use super::{DbError, DbResult};
use crate::config::DatabaseConfig;
use log::{error, info, warn};
use once_cell::sync::Lazy;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

static OPEN_PATHS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// One open SQLite connection plus the lock that serializes its use.
#[derive(Debug)]
pub struct DbHandle {
    path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
}

impl DbHandle {
    /// Canonical file path, or `None` for in-memory handles.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Runs `f` with exclusive access to the connection.
    ///
    /// A poisoned lock is recovered: SQLite rolls back any transaction left
    /// open by a panicking holder when its `Transaction` guard drops.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> DbResult<T>) -> DbResult<T> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(DbError::Closed),
        }
    }

    /// Releases the connection and its path reservation. Safe to call repeatedly.
    pub fn close(&self) -> DbResult<()> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(conn) = guard.take() else {
            return Ok(());
        };

        if let Err((conn, err)) = conn.close() {
            error!(
                "event=db_close module=db status=error mode={} error_code=db_close_failed error={}",
                self.mode(),
                err
            );
            *guard = Some(conn);
            return Err(err.into());
        }

        release_path(self.path.as_deref());
        info!("event=db_close module=db status=ok mode={}", self.mode());
        Ok(())
    }

    fn mode(&self) -> &'static str {
        if self.path.is_some() {
            "file"
        } else {
            "memory"
        }
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(
                "event=db_close module=db status=error mode={} error_code={} stage=drop",
                self.mode(),
                err.code()
            );
            // The connection is dropped with the mutex; only the reservation
            // is left to clean up.
            release_path(self.path.as_deref());
        }
    }
}

/// Opens (creating if needed) the SQLite file described by `config`.
///
/// Migrations are not applied here; see `migrations::MigrationRunner`.
///
/// # Errors
/// - `DbError::Open` when the directory is missing (and `create_dirs` is false),
///   cannot be created, or the file is not a usable SQLite database.
/// - `DbError::AlreadyOpen` when this process already holds a handle for the path.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(config: &DatabaseConfig) -> DbResult<DbHandle> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode=file");

    let result = open_file(config);
    match &result {
        Ok(_) => info!(
            "event=db_open module=db status=ok mode=file duration_ms={}",
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=db_open module=db status=error mode=file duration_ms={} error_code={} error={}",
            started_at.elapsed().as_millis(),
            err.code(),
            err
        ),
    }
    result
}

/// Opens a private in-memory database with default pragmas.
pub fn open_db_in_memory() -> DbResult<DbHandle> {
    let conn = Connection::open_in_memory().map_err(|err| DbError::Open {
        path: PathBuf::from(":memory:"),
        reason: err.to_string(),
    })?;
    let defaults = DatabaseConfig::new("", ":memory:");
    bootstrap_connection(&conn, defaults.foreign_keys, defaults.busy_timeout())?;
    info!("event=db_open module=db status=ok mode=memory");

    Ok(DbHandle {
        path: None,
        conn: Mutex::new(Some(conn)),
    })
}

fn open_file(config: &DatabaseConfig) -> DbResult<DbHandle> {
    config.validate()?;
    let dir = prepare_dir(config)?;
    let path = dir.join(config.file_name());

    reserve_path(&path)?;
    let opened = Connection::open(&path).and_then(|conn| {
        bootstrap_connection(&conn, config.foreign_keys, config.busy_timeout())?;
        Ok(conn)
    });

    match opened {
        Ok(conn) => Ok(DbHandle {
            path: Some(path),
            conn: Mutex::new(Some(conn)),
        }),
        Err(err) => {
            release_path(Some(&path));
            Err(open_error(&path, &err))
        }
    }
}

fn prepare_dir(config: &DatabaseConfig) -> DbResult<PathBuf> {
    let dir = &config.dir;
    if !dir.is_dir() {
        if !config.create_dirs {
            return Err(DbError::Open {
                path: config.full_path(),
                reason: format!("directory `{}` does not exist", dir.display()),
            });
        }
        std::fs::create_dir_all(dir).map_err(|err| DbError::Open {
            path: config.full_path(),
            reason: format!("failed to create directory `{}`: {err}", dir.display()),
        })?;
    }

    std::fs::canonicalize(dir).map_err(|err| DbError::Open {
        path: config.full_path(),
        reason: format!("failed to resolve directory `{}`: {err}", dir.display()),
    })
}

fn bootstrap_connection(
    conn: &Connection,
    foreign_keys: bool,
    busy_timeout: Duration,
) -> rusqlite::Result<()> {
    let pragma = if foreign_keys {
        "PRAGMA foreign_keys = ON;"
    } else {
        "PRAGMA foreign_keys = OFF;"
    };
    conn.execute_batch(pragma)?;
    conn.busy_timeout(busy_timeout)?;
    // Forces a header read so corrupt or non-SQLite files fail at open time.
    conn.query_row("PRAGMA schema_version;", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

fn open_error(path: &Path, err: &rusqlite::Error) -> DbError {
    DbError::Open {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn reserve_path(path: &Path) -> DbResult<()> {
    let mut open_paths = OPEN_PATHS.lock().unwrap_or_else(PoisonError::into_inner);
    if !open_paths.insert(path.to_path_buf()) {
        return Err(DbError::AlreadyOpen(path.to_path_buf()));
    }
    Ok(())
}

fn release_path(path: Option<&Path>) {
    if let Some(path) = path {
        OPEN_PATHS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }
}
