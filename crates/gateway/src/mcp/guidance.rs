//! Bridge status and guidance strings.
//!
//! `check_replies` and `send_message_to_chat_thread` answer with a coarse
//! status plus a one-line human-readable hint, both derived from the tail
//! of the event log from the external agent's point of view.

use serde::Serialize;

use parley_domain::{EventType, Finality, Snapshot, ConversationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeStatus {
    #[serde(rename = "input-required")]
    InputRequired,
    #[serde(rename = "working")]
    Working,
    #[serde(rename = "completed")]
    Completed,
}

impl BridgeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputRequired => "input-required",
            Self::Working => "working",
            Self::Completed => "completed",
        }
    }
}

/// Display name for an agent id, falling back to the id itself.
fn display_name<'a>(snap: &'a Snapshot, agent_id: &'a str) -> &'a str {
    snap.metadata
        .agents
        .iter()
        .find(|a| a.id == agent_id)
        .and_then(|a| a.display_name.as_deref())
        .unwrap_or(agent_id)
}

/// First counterpart agent (for "waiting for X" hints).
fn counterpart<'a>(snap: &'a Snapshot, external_id: &str) -> &'a str {
    snap.metadata
        .agents
        .iter()
        .find(|a| a.id != external_id)
        .map(|a| a.display_name.as_deref().unwrap_or(&a.id))
        .unwrap_or("the other participant")
}

/// Derive `(status, guidance)` for the external agent.
pub fn derive_guidance(snap: &Snapshot, external_id: &str) -> (BridgeStatus, String) {
    if snap.status == ConversationStatus::Completed {
        return (BridgeStatus::Completed, "Conversation ended.".to_owned());
    }

    // Guidance events and turn-0 system notes don't drive the hint.
    let last = snap
        .events
        .iter()
        .rev()
        .find(|e| e.event_type != EventType::Guidance && e.touches_turn_state());

    let Some(last) = last else {
        return if snap.metadata.starting_agent_id.as_deref() == Some(external_id) {
            (BridgeStatus::InputRequired, "Your turn to begin.".to_owned())
        } else {
            (
                BridgeStatus::Working,
                format!("Waiting for {} to begin.", counterpart(snap, external_id)),
            )
        };
    };

    match last.event_type {
        EventType::Message if last.finality == Finality::Turn => {
            if last.agent_id == external_id {
                (
                    BridgeStatus::Working,
                    format!("Waiting for {} to respond.", counterpart(snap, external_id)),
                )
            } else {
                (
                    BridgeStatus::InputRequired,
                    format!(
                        "{} finished; your turn.",
                        display_name(snap, &last.agent_id)
                    ),
                )
            }
        }
        EventType::System => (
            BridgeStatus::InputRequired,
            "The previous turn ended; you may speak.".to_owned(),
        ),
        _ => {
            // Mid-turn: an unclosed message or a trace.
            if last.agent_id == external_id {
                (
                    BridgeStatus::InputRequired,
                    "Your turn is still open.".to_owned(),
                )
            } else {
                (
                    BridgeStatus::Working,
                    format!(
                        "{} is composing a reply.",
                        display_name(snap, &last.agent_id)
                    ),
                )
            }
        }
    }
}
