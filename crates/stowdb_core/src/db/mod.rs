//! SQLite connection, statement execution, and schema migration layer.
//!
//! # Responsibility
//! - Own the lifetime of one open SQLite connection per database file.
//! - Run parameterized updates/queries, optionally batched in a transaction.
//! - Track and advance the schema version through ordered migration steps.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - The ledger is only written inside the transaction of the step it records.
//! - Statement-level failures are returned as values, never panics.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub mod executor;
pub mod ledger;
pub mod migrations;
mod open;
mod value;

pub use executor::{
    execute_in_transaction, execute_query, execute_update, try_execute_in_transaction,
    try_execute_update, with_transaction, SqlStatement,
};
pub use open::{open_db, open_db_in_memory, DbHandle};
pub use value::{QueryRow, SqlValue};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    /// The database file could not be created or opened.
    Open {
        path: PathBuf,
        reason: String,
    },
    /// Another handle in this process already owns the file.
    AlreadyOpen(PathBuf),
    Query(rusqlite::Error),
    Update(rusqlite::Error),
    /// A migration step failed and its transaction was rolled back.
    Transaction {
        version: u32,
        source: rusqlite::Error,
    },
    DuplicateVersion(u32),
    OutOfOrderVersion {
        previous: u32,
        version: u32,
    },
    InvalidVersion(u32),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    InvalidMigrationFile {
        path: PathBuf,
        reason: String,
    },
    NotReady(String),
    AlreadyInitialized(PathBuf),
    Closed,
    Sqlite(rusqlite::Error),
}

impl DbError {
    /// Stable snake_case code used in `error_code=` log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Open { .. } => "db_open_failed",
            Self::AlreadyOpen(_) => "db_already_open",
            Self::Query(_) => "query_failed",
            Self::Update(_) => "update_failed",
            Self::Transaction { .. } => "migration_step_failed",
            Self::DuplicateVersion(_) => "duplicate_version",
            Self::OutOfOrderVersion { .. } => "out_of_order_version",
            Self::InvalidVersion(_) => "invalid_version",
            Self::UnsupportedSchemaVersion { .. } => "unsupported_schema_version",
            Self::InvalidMigrationFile { .. } => "invalid_migration_file",
            Self::NotReady(_) => "not_ready",
            Self::AlreadyInitialized(_) => "already_initialized",
            Self::Closed => "db_closed",
            Self::Sqlite(_) => "sqlite_error",
        }
    }

    /// Returns true for migration configuration errors, which are detected
    /// before the database is touched.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateVersion(_) | Self::OutOfOrderVersion { .. } | Self::InvalidVersion(_)
        )
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { path, reason } => {
                write!(f, "failed to open database `{}`: {reason}", path.display())
            }
            Self::AlreadyOpen(path) => write!(
                f,
                "database `{}` is already open in this process",
                path.display()
            ),
            Self::Query(err) => write!(f, "query failed: {err}"),
            Self::Update(err) => write!(f, "update failed: {err}"),
            Self::Transaction { version, source } => write!(
                f,
                "migration to version {version} failed and was rolled back: {source}"
            ),
            Self::DuplicateVersion(version) => {
                write!(f, "migration version {version} is defined more than once")
            }
            Self::OutOfOrderVersion { previous, version } => write!(
                f,
                "migration version {version} is listed after {previous}; versions must be strictly increasing"
            ),
            Self::InvalidVersion(version) => {
                write!(
                    f,
                    "migration version {version} is invalid; versions must be between 1 and {}",
                    ledger::MAX_LEDGER_VERSION
                )
            }
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::InvalidMigrationFile { path, reason } => {
                write!(f, "invalid migration file `{}`: {reason}", path.display())
            }
            Self::NotReady(reason) => write!(f, "database is not ready: {reason}"),
            Self::AlreadyInitialized(path) => write!(
                f,
                "database already initialized at `{}`",
                path.display()
            ),
            Self::Closed => write!(f, "database handle is closed"),
            Self::Sqlite(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Query(err) | Self::Update(err) | Self::Sqlite(err) => Some(err),
            Self::Transaction { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
