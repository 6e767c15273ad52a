//! Conversation metadata, head bookkeeping, and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::scenario::Scenario;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Completed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(Error::Db(format!("unknown conversation status '{other}'"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One named participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Model hint for hosted agents (e.g. "gpt-4o-mini").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            model: None,
            config: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starting_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

impl ConversationMeta {
    /// Whether `agent_id` is a declared participant.
    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|a| a.id == agent_id)
    }

    /// The participant listed after `agent_id`, wrapping around. Used for
    /// "who speaks next" hints; `None` for solo conversations.
    pub fn agent_after(&self, agent_id: &str) -> Option<&AgentDescriptor> {
        if self.agents.len() < 2 {
            return None;
        }
        let idx = self.agents.iter().position(|a| a.id == agent_id)?;
        self.agents.get((idx + 1) % self.agents.len())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rows, heads, snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A conversation as listed (no events).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: ConversationStatus,
    pub metadata: ConversationMeta,
}

/// O(1) per-conversation turn bookkeeping.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    pub last_seq: u64,
    pub last_turn: u64,
    pub has_open_turn: bool,
    pub last_closed_seq: u64,
    pub status: ConversationStatus,
    /// Author of the first event of the open turn. Not part of the wire
    /// shape; used internally for trace/message ownership checks.
    #[serde(skip)]
    pub open_turn_agent: Option<String>,
}

impl Head {
    pub fn fresh() -> Self {
        Self {
            last_seq: 0,
            last_turn: 0,
            has_open_turn: false,
            last_closed_seq: 0,
            status: ConversationStatus::Active,
            open_turn_agent: None,
        }
    }
}

/// The full read-side view of a conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub status: ConversationStatus,
    pub metadata: ConversationMeta,
    pub events: Vec<Event>,
    pub last_closed_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Scenario>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ids: &[&str]) -> ConversationMeta {
        ConversationMeta {
            agents: ids.iter().map(|id| AgentDescriptor::new(*id)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn has_agent() {
        let m = meta(&["a", "b"]);
        assert!(m.has_agent("a"));
        assert!(!m.has_agent("c"));
    }

    #[test]
    fn agent_after_wraps() {
        let m = meta(&["a", "b", "c"]);
        assert_eq!(m.agent_after("a").unwrap().id, "b");
        assert_eq!(m.agent_after("c").unwrap().id, "a");
        assert!(m.agent_after("missing").is_none());
        assert!(meta(&["solo"]).agent_after("solo").is_none());
    }

    #[test]
    fn meta_wire_shape_is_camel_case() {
        let m = ConversationMeta {
            title: Some("t".into()),
            scenario_id: Some("s1".into()),
            agents: vec![AgentDescriptor::new("a")],
            starting_agent_id: Some("a".into()),
            custom: Map::new(),
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["scenarioId"], "s1");
        assert_eq!(v["startingAgentId"], "a");
    }

    #[test]
    fn fresh_head_reports_zero() {
        let h = Head::fresh();
        assert_eq!(h.last_seq, 0);
        assert_eq!(h.last_closed_seq, 0);
        assert!(!h.has_open_turn);
    }
}
