//! Embedded SQLite access layer with versioned schema migrations.
//!
//! A [`Database`] is created once per process, initialized with a file
//! location and an ordered list of [`MigrationStep`]s, and then shared with
//! every consumer that needs to read or write the database.

pub mod config;
pub mod db;
pub mod facade;
pub mod logging;

pub use config::DatabaseConfig;
pub use db::migrations::{
    load_migrations_dir, MigrationReport, MigrationRunner, MigrationState, MigrationStatus,
    MigrationStep,
};
pub use db::{DbError, DbResult, QueryRow, SqlStatement, SqlValue};
pub use facade::Database;
pub use logging::{default_log_level, init_logging, logging_status, LogLevel, LoggingError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
