//! The event model — the atomic unit of every conversation.
//!
//! Events are immutable once written. Each carries a per-conversation
//! `seq` (dense, strictly increasing, 1-based), a `turn` number (0 is
//! reserved for out-of-band events), a type tag, and a finality marker
//! that drives the turn state machine:
//!
//! ```text
//! [active, noOpenTurn] --msg/trace finality=none--> [active, openTurn(t)]
//! [active, openTurn(t)] --msg/system finality=turn--> [active, noOpenTurn]
//! [active, *]           --msg/system finality=conversation--> [completed]
//! [completed]           --any append--> error
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attachment::AttachmentRef;
use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Type and finality tags
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Message,
    Trace,
    System,
    Guidance,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Trace => "trace",
            Self::System => "system",
            Self::Guidance => "guidance",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(Self::Message),
            "trace" => Ok(Self::Trace),
            "system" => Ok(Self::System),
            "guidance" => Ok(Self::Guidance),
            other => Err(Error::Db(format!("unknown event type '{other}'"))),
        }
    }
}

/// Whether an event keeps the turn open (`none`), closes it (`turn`), or
/// ends the whole conversation (`conversation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Finality {
    #[default]
    None,
    Turn,
    Conversation,
}

impl Finality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Turn => "turn",
            Self::Conversation => "conversation",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "turn" => Ok(Self::Turn),
            "conversation" => Ok(Self::Conversation),
            other => Err(Error::Db(format!("unknown finality '{other}'"))),
        }
    }

    /// True when this finality closes a turn (or the conversation).
    pub fn closes_turn(self) -> bool {
        !matches!(self, Self::None)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MessagePayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Agent working-state events. Tagged so the boundary validates once and
/// the rest of the system matches on typed variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TracePayload {
    Thought {
        content: String,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TurnCleared {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TurnAborted {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemPayload {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Scheduling hint. Never affects turn state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuidancePayload {
    pub next_agent_id: String,
    pub deadline_ms: u64,
    pub kind: String,
}

/// Untagged union over the four payload shapes. The field sets are
/// disjoint (trace carries its own `type` tag), so deserialization is
/// unambiguous; [`EventPayload::matches`] cross-checks the variant against
/// the event type at ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EventPayload {
    Trace(TracePayload),
    Guidance(GuidancePayload),
    System(SystemPayload),
    Message(MessagePayload),
}

impl EventPayload {
    /// Whether this payload variant is legal for the given event type.
    pub fn matches(&self, event_type: EventType) -> bool {
        matches!(
            (self, event_type),
            (Self::Message(_), EventType::Message)
                | (Self::Trace(_), EventType::Trace)
                | (Self::System(_), EventType::System)
                | (Self::Guidance(_), EventType::Guidance)
        )
    }

    pub fn as_message(&self) -> Option<&MessagePayload> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_trace(&self) -> Option<&TracePayload> {
        match self {
            Self::Trace(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_guidance(&self) -> Option<&GuidancePayload> {
        match self {
            Self::Guidance(g) => Some(g),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The agent id used for orchestrator-authored events. Privileged: exempt
/// from participant and turn-ownership checks.
pub const SYSTEM_AGENT: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub conversation: i64,
    pub seq: u64,
    pub turn: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub finality: Finality,
    pub agent_id: String,
    pub ts: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// True for events that participate in turn-state bookkeeping
    /// (message/trace always; system only when placed on a positive turn).
    pub fn touches_turn_state(&self) -> bool {
        match self.event_type {
            EventType::Message | EventType::Trace => true,
            EventType::System => self.turn > 0,
            EventType::Guidance => false,
        }
    }
}

/// What `append` hands back: the assigned sequence number and turn.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AppendOutcome {
    pub seq: u64,
    pub turn: u64,
}
