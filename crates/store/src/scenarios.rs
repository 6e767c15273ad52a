//! Versioned scenario documents.
//!
//! Scenarios are immutable per version. `update` writes a new version and
//! flips the active pointer in one transaction; `get_active` always reads
//! through the pointer.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_domain::{Error, Result, Scenario};

use crate::db::{fmt_ts, Db};

#[derive(Clone)]
pub struct ScenarioStore {
    db: Db,
}

impl ScenarioStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a new scenario (version 1, active). Fails if the id exists.
    pub fn insert(&self, scenario: &Scenario) -> Result<()> {
        if scenario.id().is_empty() {
            return Err(Error::InvalidEvent("scenario id must not be empty".into()));
        }
        let config_json = serde_json::to_string(scenario)?;
        let mut conn = self.db.conn();
        let tx = conn.transaction().map_err(Error::db)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO scenarios (id, name, active_version) VALUES (?1, ?2, 1)",
                params![scenario.id(), scenario.metadata.title],
            )
            .map_err(Error::db)?;
        if inserted == 0 {
            return Err(Error::PreconditionFailed(format!(
                "scenario '{}' already exists",
                scenario.id()
            )));
        }
        tx.execute(
            "INSERT INTO scenario_versions
               (scenario_id, version_number, config_json, created_at, is_active)
             VALUES (?1, 1, ?2, ?3, 1)",
            params![scenario.id(), config_json, fmt_ts(Utc::now())],
        )
        .map_err(Error::db)?;
        tx.commit().map_err(Error::db)
    }

    /// The currently active version, or `None`.
    pub fn get_active(&self, id: &str) -> Result<Option<Scenario>> {
        let conn = self.db.conn();
        let config: Option<String> = conn
            .query_row(
                "SELECT v.config_json
                 FROM scenarios s
                 JOIN scenario_versions v
                   ON v.scenario_id = s.id AND v.version_number = s.active_version
                 WHERE s.id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::db)?;
        match config {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Active versions of all scenarios, ordered by id.
    pub fn list(&self) -> Result<Vec<Scenario>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(
                "SELECT v.config_json
                 FROM scenarios s
                 JOIN scenario_versions v
                   ON v.scenario_id = s.id AND v.version_number = s.active_version
                 ORDER BY s.id",
            )
            .map_err(Error::db)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(Error::db)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw.map_err(Error::db)?)?);
        }
        Ok(out)
    }

    /// Write a new version and make it active, atomically.
    pub fn update(&self, id: &str, scenario: &Scenario) -> Result<()> {
        let config_json = serde_json::to_string(scenario)?;
        let mut conn = self.db.conn();
        let tx = conn.transaction().map_err(Error::db)?;
        let next: Option<i64> = tx
            .query_row(
                "SELECT MAX(version_number) + 1 FROM scenario_versions WHERE scenario_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::db)?
            .flatten();
        let next = next.ok_or_else(|| Error::NotFound(format!("scenario {id}")))?;
        tx.execute(
            "UPDATE scenario_versions SET is_active = 0 WHERE scenario_id = ?1",
            params![id],
        )
        .map_err(Error::db)?;
        tx.execute(
            "INSERT INTO scenario_versions
               (scenario_id, version_number, config_json, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![id, next, config_json, fmt_ts(Utc::now())],
        )
        .map_err(Error::db)?;
        tx.execute(
            "UPDATE scenarios SET active_version = ?2, name = ?3 WHERE id = ?1",
            params![id, next, scenario.metadata.title],
        )
        .map_err(Error::db)?;
        tx.commit().map_err(Error::db)
    }

    /// Remove a scenario and all its versions.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut conn = self.db.conn();
        let tx = conn.transaction().map_err(Error::db)?;
        tx.execute(
            "DELETE FROM scenario_versions WHERE scenario_id = ?1",
            params![id],
        )
        .map_err(Error::db)?;
        let deleted = tx
            .execute("DELETE FROM scenarios WHERE id = ?1", params![id])
            .map_err(Error::db)?;
        tx.commit().map_err(Error::db)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ScenarioStore {
        ScenarioStore::new(Db::open_in_memory().unwrap())
    }

    fn scenario(id: &str, title: &str) -> Scenario {
        serde_json::from_value(serde_json::json!({
            "metadata": {"id": id, "title": title},
            "scenario": {"background": "bg", "challenges": []},
            "agents": []
        }))
        .unwrap()
    }

    #[test]
    fn insert_and_get_active() {
        let s = store();
        s.insert(&scenario("s1", "First")).unwrap();
        let got = s.get_active("s1").unwrap().unwrap();
        assert_eq!(got.metadata.title, "First");
        assert!(s.get_active("s2").unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_fails() {
        let s = store();
        s.insert(&scenario("s1", "First")).unwrap();
        assert!(matches!(
            s.insert(&scenario("s1", "Again")).unwrap_err(),
            Error::PreconditionFailed(_)
        ));
    }

    #[test]
    fn update_creates_new_active_version() {
        let s = store();
        s.insert(&scenario("s1", "v1")).unwrap();
        s.update("s1", &scenario("s1", "v2")).unwrap();
        assert_eq!(s.get_active("s1").unwrap().unwrap().metadata.title, "v2");
        // Both versions persisted.
        let db = s.db.conn();
        let count: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM scenario_versions WHERE scenario_id = 's1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn update_unknown_is_not_found() {
        assert!(matches!(
            store().update("ghost", &scenario("ghost", "x")).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn list_returns_active_versions() {
        let s = store();
        s.insert(&scenario("a", "A")).unwrap();
        s.insert(&scenario("b", "B")).unwrap();
        s.update("a", &scenario("a", "A2")).unwrap();
        let all = s.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].metadata.title, "A2");
    }

    #[test]
    fn delete_removes_everything() {
        let s = store();
        s.insert(&scenario("s1", "First")).unwrap();
        assert!(s.delete("s1").unwrap());
        assert!(!s.delete("s1").unwrap());
        assert!(s.get_active("s1").unwrap().is_none());
    }
}
