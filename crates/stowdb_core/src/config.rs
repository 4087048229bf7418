//! Database location and connection settings.
//!
//! # Responsibility
//! - Describe where the database file lives and how connections are bootstrapped.
//! - Reject file names that would escape the configured directory.
//!
//! # Invariants
//! - `file_name` is a bare file name (no separators, not empty).

use crate::db::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Settings consumed by `open_db` and `Database::initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the database file.
    pub dir: PathBuf,
    /// File name inside `dir`.
    pub file_name: String,
    /// Create `dir` (and its parents) when missing. When false a missing
    /// directory fails the open.
    #[serde(default = "default_create_dirs")]
    pub create_dirs: bool,
    /// Engine-side wait on lock contention before reporting `SQLITE_BUSY`.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_foreign_keys")]
    pub foreign_keys: bool,
}

impl DatabaseConfig {
    pub fn new(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_name: file_name.into(),
            create_dirs: default_create_dirs(),
            busy_timeout_ms: default_busy_timeout_ms(),
            foreign_keys: default_foreign_keys(),
        }
    }

    /// `file_name` with surrounding whitespace removed.
    pub fn file_name(&self) -> &str {
        self.file_name.trim()
    }

    /// Full path of the database file.
    pub fn full_path(&self) -> PathBuf {
        self.dir.join(self.file_name())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Checks the file name before any file-system work happens.
    ///
    /// # Errors
    /// - Returns `DbError::Open` when `file_name` is empty or contains a path
    ///   separator.
    pub fn validate(&self) -> DbResult<()> {
        let trimmed = self.file_name();
        let reason = if trimmed.is_empty() {
            Some("file name cannot be empty")
        } else if trimmed.contains(['/', '\\']) {
            Some("file name must not contain path separators")
        } else if trimmed == "." || trimmed == ".." {
            Some("file name must name a file")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(DbError::Open {
                path: self.full_path(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn default_create_dirs() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_foreign_keys() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::DatabaseConfig;
    use std::path::Path;

    #[test]
    fn new_applies_defaults() {
        let config = DatabaseConfig::new("/tmp/stow", "app.sqlite3");
        assert!(config.create_dirs);
        assert!(config.foreign_keys);
        assert_eq!(config.busy_timeout().as_secs(), 5);
        assert_eq!(config.full_path(), Path::new("/tmp/stow/app.sqlite3"));
    }

    #[test]
    fn deserialize_fills_missing_fields_with_defaults() {
        let json = r#"{"dir":"/var/data","file_name":"main.db","foreign_keys":false}"#;
        let config: DatabaseConfig =
            serde_json::from_str(json).expect("config json should parse");
        assert!(config.create_dirs);
        assert!(!config.foreign_keys);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn validate_rejects_bad_file_names() {
        for name in ["", "   ", "nested/app.db", "..\\app.db", ".."] {
            let config = DatabaseConfig::new("/tmp", name);
            assert!(config.validate().is_err(), "`{name}` should be rejected");
        }
        assert!(DatabaseConfig::new("/tmp", "app.db").validate().is_ok());
    }

    #[test]
    fn full_path_ignores_surrounding_whitespace() {
        let config = DatabaseConfig::new("/tmp/stow", " app.db ");
        assert!(config.validate().is_ok());
        assert_eq!(config.file_name(), "app.db");
        assert_eq!(config.full_path(), Path::new("/tmp/stow/app.db"));
    }
}
