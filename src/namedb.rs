//! Persistent digest → original-name table backing the long name translation.
//!
//! Append-only and first-write-wins: once a digest has been recorded the
//! stored name is never replaced, so a surrogate directory entry stays
//! resolvable for as long as the database file exists.

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use sha2::{Digest, Sha256};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS filename_translation (
    digest TEXT NOT NULL,
    name BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_filename_translation_digest
    ON filename_translation(digest);
"#;

/// Hex digest of a path component's raw bytes.
pub fn digest_hex(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hex::encode(hasher.finalize())
}

pub struct NameDb {
    conn: Connection,
}

impl NameDb {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        Self::setup(Connection::open(path)?)
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        Self::setup(Connection::open_in_memory()?)
    }

    fn setup(conn: Connection) -> SqliteResult<Self> {
        // journal_mode returns the resulting mode as a row, so it cannot go
        // through execute().
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA cache_size = -65536")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Digest the component and persist the pair if this digest is new.
    /// Returns the digest either way.
    pub fn record(&self, name: &[u8]) -> SqliteResult<String> {
        let digest = digest_hex(name);
        self.insert_if_absent(&digest, name)?;
        Ok(digest)
    }

    fn insert_if_absent(&self, digest: &str, name: &[u8]) -> SqliteResult<()> {
        self.conn.execute(
            "INSERT INTO filename_translation (digest, name)
             SELECT ?1, ?2
             WHERE NOT EXISTS
                 (SELECT 1 FROM filename_translation WHERE digest = ?1)",
            params![digest, name],
        )?;
        Ok(())
    }

    /// The original name recorded for a digest, if any.
    pub fn resolve(&self, digest: &str) -> SqliteResult<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT name FROM filename_translation WHERE digest = ?1 LIMIT 1",
                params![digest],
                |row| row.get(0),
            )
            .optional()
    }
}
