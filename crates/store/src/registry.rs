//! Agent lifecycle registry — the persistent intent table.
//!
//! A row means "this server should host this agent in this conversation".
//! Rows are the durable half of the lifecycle split: the agent host holds
//! the in-memory workers, this table survives restarts and drives boot
//! reconciliation.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_domain::{Error, Result};

use crate::db::{fmt_ts, parse_ts, Db};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRow {
    pub conversation_id: i64,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RegistryStore {
    db: Db,
}

impl RegistryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Idempotent upsert: record intent to host `agent_ids` in `conv`.
    pub fn ensure(&self, conv: i64, agent_ids: &[String]) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let conn = self.db.conn();
        for agent_id in agent_ids {
            conn.execute(
                "INSERT OR IGNORE INTO runner_registry (conversation_id, agent_id, started_at)
                 VALUES (?1, ?2, ?3)",
                params![conv, agent_id, now],
            )
            .map_err(Error::db)?;
        }
        Ok(())
    }

    /// Delete all rows for a conversation. Returns how many were removed.
    pub fn stop(&self, conv: i64) -> Result<usize> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM runner_registry WHERE conversation_id = ?1",
            params![conv],
        )
        .map_err(Error::db)
    }

    /// Every row, ordered for deterministic boot.
    pub fn list(&self) -> Result<Vec<RegistryRow>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, agent_id, started_at
                 FROM runner_registry
                 ORDER BY conversation_id, agent_id",
            )
            .map_err(Error::db)?;
        let rows = stmt
            .query_map([], |row| {
                let started: String = row.get(2)?;
                Ok(RegistryRow {
                    conversation_id: row.get(0)?,
                    agent_id: row.get(1)?,
                    started_at: parse_ts(&started).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            })
            .map_err(Error::db)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::db)
    }

    /// Agent ids registered for one conversation.
    pub fn list_for(&self, conv: i64) -> Result<Vec<String>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(
                "SELECT agent_id FROM runner_registry
                 WHERE conversation_id = ?1 ORDER BY agent_id",
            )
            .map_err(Error::db)?;
        let rows = stmt
            .query_map(params![conv], |row| row.get::<_, String>(0))
            .map_err(Error::db)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::db)
    }
}
