//! Database handle — connection setup and embedded schema.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use parley_domain::{Error, Result};

/// Embedded schema, applied at open. Statements are idempotent so re-opening
/// an existing database is a no-op.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'active',
    meta_json   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    conversation INTEGER NOT NULL,
    seq          INTEGER NOT NULL,
    turn         INTEGER NOT NULL,
    type         TEXT NOT NULL,
    finality     TEXT NOT NULL,
    agent_id     TEXT NOT NULL,
    ts           TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    PRIMARY KEY (conversation, seq)
);

CREATE INDEX IF NOT EXISTS idx_events_conversation_turn
    ON events (conversation, turn);

CREATE TABLE IF NOT EXISTS attachments (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    content_type TEXT NOT NULL,
    content      BLOB NOT NULL,
    summary      TEXT,
    doc_id       TEXT,
    content_hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attachments_hash
    ON attachments (content_hash);

CREATE TABLE IF NOT EXISTS scenarios (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    active_version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scenario_versions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    scenario_id    TEXT NOT NULL,
    version_number INTEGER NOT NULL,
    config_json    TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    is_active      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS runner_registry (
    conversation_id INTEGER NOT NULL,
    agent_id        TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    PRIMARY KEY (conversation_id, agent_id)
);
"#;

/// Shared SQLite handle. Clones share the underlying connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(Error::db)?;
        Self::init(conn)
    }

    /// Open a throwaway in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::db)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(Error::db)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(Error::db)?;
        conn.execute_batch(SCHEMA).map_err(Error::db)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for a batch of statements.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Canonical timestamp encoding: RFC 3339 with microseconds, UTC. Sortable
/// as text, so SQL comparisons against other encoded timestamps are valid.
pub(crate) fn fmt_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| Error::Db(format!("bad timestamp '{raw}': {e}")))
}
