//! Relational metastore backed by SQLite.
//!
//! One table, one row per key version:
//!
//! ```sql
//! encryption_key(id TEXT, created INTEGER, key_record TEXT, PRIMARY KEY (id, created))
//! ```
//!
//! `key_record` holds the canonical JSON of the `EnvelopeKeyRecord`. The
//! primary key makes `INSERT OR IGNORE` a conditional create.

use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::envelope::{self, EnvelopeKeyRecord};
use crate::error::KeystrataError;
use crate::keys::KeyMeta;
use crate::metastore::Metastore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS encryption_key (
    id TEXT NOT NULL,
    created INTEGER NOT NULL,
    key_record TEXT NOT NULL,
    PRIMARY KEY (id, created)
);";

pub struct SqliteMetastore {
    conn: Mutex<Connection>,
}

impl SqliteMetastore {
    /// Open (creating if needed) the database named by `connection_string`.
    ///
    /// Accepts `sqlite://<path>`, a plain filesystem path, or `:memory:`.
    /// Lock contention longer than `busy_timeout` surfaces as
    /// `DependencyTimeout`.
    pub fn open(connection_string: &str, busy_timeout: Duration) -> Result<Self, KeystrataError> {
        let path = connection_string
            .strip_prefix("sqlite://")
            .unwrap_or(connection_string);
        if path.is_empty() {
            return Err(KeystrataError::Config(
                "ConnectionString names no database".into(),
            ));
        }

        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path, "sqlite metastore opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Metastore for SqliteMetastore {
    fn load(&self, meta: &KeyMeta) -> Result<Option<EnvelopeKeyRecord>, KeystrataError> {
        let text: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT key_record FROM encryption_key WHERE id = ?1 AND created = ?2",
                params![meta.id, meta.created],
                |row| row.get(0),
            )
            .optional()?;
        text.as_deref().map(envelope::decode_key_record).transpose()
    }

    fn load_latest(&self, key_id: &str) -> Result<Option<EnvelopeKeyRecord>, KeystrataError> {
        let text: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT key_record FROM encryption_key WHERE id = ?1 ORDER BY created DESC LIMIT 1",
                params![key_id],
                |row| row.get(0),
            )
            .optional()?;
        text.as_deref().map(envelope::decode_key_record).transpose()
    }

    fn store(&self, meta: &KeyMeta, record: &EnvelopeKeyRecord) -> Result<bool, KeystrataError> {
        let text = envelope::encode_key_record(record)?;
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO encryption_key (id, created, key_record) VALUES (?1, ?2, ?3)",
            params![meta.id, meta.created, text],
        )?;
        debug!(key = %meta, inserted = inserted > 0, "sqlite store");
        Ok(inserted > 0)
    }
}

impl std::fmt::Debug for SqliteMetastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetastore").finish_non_exhaustive()
    }
}
