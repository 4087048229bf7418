//! Persisted schema version ledger.
//!
//! The applied version lives in `PRAGMA user_version`, which SQLite keeps in
//! the database header. It is written as part of the enclosing transaction and
//! rolls back with it, and it cannot collide with application table names.

use super::{DbError, DbResult};
use rusqlite::{Connection, Transaction};

/// `user_version` is a signed 32-bit header field.
pub const MAX_LEDGER_VERSION: u32 = i32::MAX as u32;

/// Returns the applied schema version; `0` for a fresh database.
pub fn read_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}

/// Records `version` as applied.
///
/// Takes a `Transaction` so the ledger can only move together with the
/// migration step it records.
///
/// # Errors
/// - `DbError::InvalidVersion` when `version` is outside `1..=MAX_LEDGER_VERSION`
///   or the stored value does not read back as `version`.
pub fn write_version(tx: &Transaction<'_>, version: u32) -> DbResult<()> {
    if version == 0 || version > MAX_LEDGER_VERSION {
        return Err(DbError::InvalidVersion(version));
    }
    // PRAGMA arguments cannot be bound; `version` is a typed integer.
    tx.execute_batch(&format!("PRAGMA user_version = {version};"))?;
    if read_version(tx)? != version {
        return Err(DbError::InvalidVersion(version));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_version, write_version, MAX_LEDGER_VERSION};
    use crate::db::DbError;
    use rusqlite::Connection;

    #[test]
    fn fresh_database_reads_zero() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(read_version(&conn).unwrap(), 0);
    }

    #[test]
    fn version_write_follows_transaction_outcome() {
        let mut conn = Connection::open_in_memory().unwrap();

        let tx = conn.transaction().unwrap();
        write_version(&tx, 3).unwrap();
        tx.commit().unwrap();
        assert_eq!(read_version(&conn).unwrap(), 3);

        let tx = conn.transaction().unwrap();
        write_version(&tx, 4).unwrap();
        tx.rollback().unwrap();
        assert_eq!(read_version(&conn).unwrap(), 3);
    }

    #[test]
    fn versions_beyond_the_header_field_are_refused() {
        let mut conn = Connection::open_in_memory().unwrap();

        let tx = conn.transaction().unwrap();
        write_version(&tx, MAX_LEDGER_VERSION).unwrap();
        let err = write_version(&tx, 3_000_000_000).unwrap_err();
        assert!(
            matches!(err, DbError::InvalidVersion(3_000_000_000)),
            "unexpected error: {err}"
        );
        tx.commit().unwrap();

        assert_eq!(read_version(&conn).unwrap(), MAX_LEDGER_VERSION);
    }
}
