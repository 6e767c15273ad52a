//! Conversation rows — creation, lookup, listing, staleness queries.
//!
//! Status transitions happen inside [`crate::events::EventStore::append`]
//! (a `finality=conversation` event flips the row to `completed` in the
//! same transaction); this store only ever creates and reads rows.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use parley_domain::{ConversationMeta, ConversationRow, ConversationStatus, Error, Result};

use crate::db::{fmt_ts, parse_ts, Db};

#[derive(Clone)]
pub struct ConversationStore {
    db: Db,
}

impl ConversationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Allocate a new conversation id. Writes no events.
    pub fn create(&self, meta: &ConversationMeta) -> Result<i64> {
        let now = fmt_ts(Utc::now());
        let meta_json = serde_json::to_string(meta)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO conversations (created_at, updated_at, status, meta_json)
             VALUES (?1, ?1, 'active', ?2)",
            params![now, meta_json],
        )
        .map_err(Error::db)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, conv: i64) -> Result<ConversationRow> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT id, created_at, updated_at, status, meta_json
             FROM conversations WHERE id = ?1",
            params![conv],
            row_to_conversation,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                Error::NotFound(format!("conversation {conv}"))
            }
            other => Error::db(other),
        })
    }

    /// Most recently updated conversations, optionally restricted to the
    /// last `hours`.
    pub fn list(&self, limit: usize, hours: Option<u64>) -> Result<Vec<ConversationRow>> {
        let cutoff = hours.map(|h| fmt_ts(Utc::now() - Duration::hours(h as i64)));
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, created_at, updated_at, status, meta_json
                 FROM conversations
                 WHERE (?1 IS NULL OR updated_at >= ?1)
                 ORDER BY updated_at DESC
                 LIMIT ?2",
            )
            .map_err(Error::db)?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64], row_to_conversation)
            .map_err(Error::db)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::db)
    }

    /// Active conversations whose last activity predates `stalled_before`
    /// and whose creation predates `created_before`. Watchdog input.
    pub fn stalled(
        &self,
        stalled_before: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM conversations
                 WHERE status = 'active' AND updated_at < ?1 AND created_at < ?2
                 ORDER BY id",
            )
            .map_err(Error::db)?;
        let rows = stmt
            .query_map(
                params![fmt_ts(stalled_before), fmt_ts(created_before)],
                |row| row.get::<_, i64>(0),
            )
            .map_err(Error::db)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::db)
    }

    /// Status of every conversation id in the registry, for boot
    /// reconciliation.
    pub fn status(&self, conv: i64) -> Result<ConversationStatus> {
        Ok(self.get(conv)?.status)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let created_at: String = row.get(1)?;
    let updated_at: String = row.get(2)?;
    let status: String = row.get(3)?;
    let meta_json: String = row.get(4)?;
    Ok(ConversationRow {
        id: row.get(0)?,
        created_at: parse_ts(&created_at).map_err(to_sql_err)?,
        updated_at: parse_ts(&updated_at).map_err(to_sql_err)?,
        status: ConversationStatus::parse(&status).map_err(to_sql_err)?,
        metadata: serde_json::from_str::<ConversationMeta>(&meta_json)
            .map_err(|e| to_sql_err(Error::from(e)))?,
    })
}

fn to_sql_err(e: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}
