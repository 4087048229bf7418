//! Loads migration steps from `<version>_<name>.sql` files.
//!
//! # Invariants
//! - Only `*.sql` regular files are considered; everything else is ignored.
//! - Returned steps are sorted ascending by version.

use super::MigrationStep;
use crate::db::{ledger, DbError, DbResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static MIGRATION_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<version>[0-9]+)_(?P<name>[A-Za-z0-9_-]+)\.sql$")
        .expect("valid migration file regex")
});

/// Reads every migration file in `dir`.
///
/// # Errors
/// - `DbError::InvalidMigrationFile` when the directory cannot be read, a
///   `.sql` file name does not match the pattern, or a file cannot be read.
/// - `DbError::DuplicateVersion` when two files share a version
///   (for example `1_a.sql` and `001_b.sql`).
pub fn load_migrations_dir(dir: impl AsRef<Path>) -> DbResult<Vec<MigrationStep>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|err| invalid(dir, err.to_string()))?;

    let mut steps = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| invalid(dir, err.to_string()))?.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }
        steps.push(parse_file(&path)?);
    }

    steps.sort_by_key(|step| step.version);
    if let Some(pair) = steps.windows(2).find(|pair| pair[0].version == pair[1].version) {
        return Err(DbError::DuplicateVersion(pair[0].version));
    }

    Ok(steps)
}

fn parse_file(path: &Path) -> DbResult<MigrationStep> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| invalid(path, "file name is not valid UTF-8".to_string()))?;

    let captures = MIGRATION_FILE_RE.captures(file_name).ok_or_else(|| {
        invalid(
            path,
            "expected `<version>_<name>.sql` with an ascii name".to_string(),
        )
    })?;
    let version = captures["version"]
        .parse::<u32>()
        .map_err(|err| invalid(path, format!("bad version number: {err}")))?;
    if version == 0 || version > ledger::MAX_LEDGER_VERSION {
        return Err(DbError::InvalidVersion(version));
    }

    let sql = std::fs::read_to_string(path).map_err(|err| invalid(path, err.to_string()))?;
    Ok(MigrationStep::sql(version, &captures["name"], sql))
}

fn invalid(path: &Path, reason: String) -> DbError {
    DbError::InvalidMigrationFile {
        path: PathBuf::from(path),
        reason,
    }
}
