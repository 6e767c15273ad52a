//! The orchestrator — single write path into a conversation.
//!
//! Every append runs under the conversation's lock: validate, persist,
//! publish to the hub, release. Publishing inside the lock is what gives
//! subscribers strict seq order with no gaps.
//!
//! Reads never take the write lock; they observe a committed prefix.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use parley_domain::event::SYSTEM_AGENT;
use parley_domain::{
    AppendOutcome, Attachment, ConversationMeta, ConversationRow, Error, Event, EventPayload,
    EventType, Finality, GuidancePayload, Head, MessagePayload, Result, Snapshot, SystemPayload,
    TracePayload,
};
use parley_store::attachments::NewAttachment;
use parley_store::{
    AttachmentStore, AppendRequest, ConversationStore, Db, EventStore, ScenarioStore,
};

use crate::hub::{FirehoseSubscription, Subscription, SubscriptionHub};
use crate::locks::ConversationLocks;

pub struct Orchestrator {
    events: EventStore,
    conversations: ConversationStore,
    attachments: AttachmentStore,
    scenarios: ScenarioStore,
    hub: SubscriptionHub,
    locks: ConversationLocks,
    max_payload_bytes: usize,
}

impl Orchestrator {
    pub fn new(db: Db, max_payload_bytes: usize) -> Self {
        Self {
            events: EventStore::new(db.clone()),
            conversations: ConversationStore::new(db.clone()),
            attachments: AttachmentStore::new(db.clone()),
            scenarios: ScenarioStore::new(db),
            hub: SubscriptionHub::new(),
            locks: ConversationLocks::new(),
            max_payload_bytes,
        }
    }

    pub fn scenarios(&self) -> &ScenarioStore {
        &self.scenarios
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Conversation lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Allocate a conversation. Writes no events.
    pub fn create_conversation(&self, meta: ConversationMeta) -> Result<i64> {
        let mut seen = std::collections::HashSet::new();
        for agent in &meta.agents {
            if agent.id.is_empty() {
                return Err(Error::InvalidEvent("agent id must not be empty".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::InvalidEvent(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
        }
        if let Some(starter) = &meta.starting_agent_id {
            if !meta.has_agent(starter) {
                return Err(Error::InvalidEvent(format!(
                    "starting agent '{starter}' is not in the agent list"
                )));
            }
        }
        let conv = self.conversations.create(&meta)?;
        tracing::info!(conversation = conv, agents = meta.agents.len(), "conversation created");
        self.hub.announce_conversation(conv);
        Ok(conv)
    }

    pub fn list_conversations(
        &self,
        limit: usize,
        hours: Option<u64>,
    ) -> Result<Vec<ConversationRow>> {
        self.conversations.list(limit, hours)
    }

    pub fn head(&self, conv: i64) -> Result<Head> {
        self.events.head(conv)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Appends
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Append a message event. `finality=conversation` also flips the
    /// conversation to `completed`, atomically with the append.
    pub fn send_message(
        &self,
        conv: i64,
        agent_id: &str,
        payload: MessagePayload,
        finality: Finality,
        turn: Option<u64>,
    ) -> Result<AppendOutcome> {
        self.check_participant(conv, agent_id)?;
        let payload = EventPayload::Message(payload);
        self.check_payload_size(&payload)?;
        self.append_locked(
            conv,
            AppendRequest {
                event_type: EventType::Message,
                finality,
                agent_id: agent_id.to_owned(),
                turn,
                payload,
            },
        )
    }

    /// Append a trace event into the agent's turn.
    ///
    /// With a turn open, the poster must own it. With no turn open, an
    /// explicit `turn = last_turn + 1` opens one (an agent starting its
    /// turn with a thought or tool call); omitting the turn is an error.
    pub fn post_trace(
        &self,
        conv: i64,
        agent_id: &str,
        payload: TracePayload,
        turn: Option<u64>,
    ) -> Result<AppendOutcome> {
        self.check_participant(conv, agent_id)?;
        let payload = EventPayload::Trace(payload);
        self.check_payload_size(&payload)?;
        self.locks.with(conv, || {
            let head = self.events.head(conv)?;
            if head.has_open_turn {
                if let Some(owner) = &head.open_turn_agent {
                    if owner != agent_id && agent_id != SYSTEM_AGENT {
                        return Err(Error::WrongAgent {
                            agent: agent_id.to_owned(),
                            owner: owner.clone(),
                        });
                    }
                }
            } else if turn.is_none() {
                return Err(Error::NoOpenTurn);
            }
            let event = self.events.append(
                conv,
                AppendRequest {
                    event_type: EventType::Trace,
                    finality: Finality::None,
                    agent_id: agent_id.to_owned(),
                    turn,
                    payload,
                },
            )?;
            self.hub.publish(&event);
            Ok(AppendOutcome {
                seq: event.seq,
                turn: event.turn,
            })
        })
    }

    /// Write a system note on turn 0. `finality=conversation` ends the
    /// conversation without touching turn numbering.
    pub fn post_system(
        &self,
        conv: i64,
        kind: &str,
        data: Value,
        finality: Finality,
    ) -> Result<AppendOutcome> {
        if finality == Finality::Turn {
            return Err(Error::InvalidEvent(
                "turn-0 system notes cannot close a turn".into(),
            ));
        }
        self.append_locked(
            conv,
            AppendRequest {
                event_type: EventType::System,
                finality,
                agent_id: SYSTEM_AGENT.to_owned(),
                turn: None,
                payload: EventPayload::System(SystemPayload {
                    kind: kind.to_owned(),
                    data,
                }),
            },
        )
    }

    /// Write a scheduling hint. Never fails due to turn state.
    pub fn post_guidance(
        &self,
        conv: i64,
        next_agent_id: &str,
        deadline_ms: u64,
        kind: &str,
    ) -> Result<AppendOutcome> {
        self.append_locked(
            conv,
            AppendRequest {
                event_type: EventType::Guidance,
                finality: Finality::None,
                agent_id: SYSTEM_AGENT.to_owned(),
                turn: None,
                payload: EventPayload::Guidance(GuidancePayload {
                    next_agent_id: next_agent_id.to_owned(),
                    deadline_ms,
                    kind: kind.to_owned(),
                }),
            },
        )
    }

    /// Abort the open turn, or stamp an empty closed turn when none is
    /// open. Used by the watchdog path and cascaded cancellation.
    pub fn cancel_turn(&self, conv: i64, reason: &str) -> Result<AppendOutcome> {
        let out = self.cancel_with(conv, reason, Finality::Turn, "turn_cancelled")?;
        tracing::info!(conversation = conv, turn = out.turn, reason, "turn cancelled");
        Ok(out)
    }

    /// Terminate a conversation: abort any open turn, then write the
    /// terminal `system` event on the correct next turn.
    pub fn cancel_conversation(&self, conv: i64, reason: &str) -> Result<AppendOutcome> {
        let out = self.cancel_with(conv, reason, Finality::Conversation, "conversation_cancelled")?;
        tracing::info!(conversation = conv, reason, "conversation cancelled");
        Ok(out)
    }

    /// Shared cancellation path: a `turn_aborted` trace into the open
    /// turn (if any), then the closing `system` event. The closing event
    /// lands on the open turn, or on `last_turn + 1` when none is open.
    fn cancel_with(
        &self,
        conv: i64,
        reason: &str,
        finality: Finality,
        kind: &str,
    ) -> Result<AppendOutcome> {
        self.locks.with(conv, || {
            let head = self.events.head(conv)?;
            let close_turn = if head.has_open_turn {
                let aborted = self.events.append(
                    conv,
                    AppendRequest {
                        event_type: EventType::Trace,
                        finality: Finality::None,
                        agent_id: SYSTEM_AGENT.to_owned(),
                        turn: Some(head.last_turn),
                        payload: EventPayload::Trace(TracePayload::TurnAborted {
                            reason: Some(reason.to_owned()),
                        }),
                    },
                )?;
                self.hub.publish(&aborted);
                head.last_turn
            } else {
                head.last_turn + 1
            };
            let closing = self.events.append(
                conv,
                AppendRequest {
                    event_type: EventType::System,
                    finality,
                    agent_id: SYSTEM_AGENT.to_owned(),
                    turn: Some(close_turn),
                    payload: EventPayload::System(SystemPayload {
                        kind: kind.to_owned(),
                        data: serde_json::json!({ "reason": reason }),
                    }),
                },
            )?;
            self.hub.publish(&closing);
            Ok(AppendOutcome {
                seq: closing.seq,
                turn: closing.turn,
            })
        })
    }

    fn append_locked(&self, conv: i64, req: AppendRequest) -> Result<AppendOutcome> {
        self.locks.with(conv, || {
            let event = self.events.append(conv, req)?;
            self.hub.publish(&event);
            Ok(AppendOutcome {
                seq: event.seq,
                turn: event.turn,
            })
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Reads
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Full read-side view. `last_closed_seq` is derived from the same
    /// event prefix the snapshot returns, so the pair is always
    /// internally consistent.
    pub fn snapshot(&self, conv: i64, include_scenario: bool) -> Result<Snapshot> {
        let row = self.conversations.get(conv)?;
        let events = self.events.events_since(conv, 0)?;
        let last_closed_seq = events
            .iter()
            .filter(|e| e.finality.closes_turn())
            .map(|e| e.seq)
            .max()
            .unwrap_or(0);
        let scenario = if include_scenario {
            match &row.metadata.scenario_id {
                Some(id) => self.scenarios.get_active(id)?,
                None => None,
            }
        } else {
            None
        };
        Ok(Snapshot {
            status: row.status,
            metadata: row.metadata,
            events,
            last_closed_seq,
            scenario,
        })
    }

    pub fn events_page(&self, conv: i64, since_seq: u64, limit: usize) -> Result<Vec<Event>> {
        self.events.events_page(conv, since_seq, limit)
    }

    pub fn events_since(&self, conv: i64, since_seq: u64) -> Result<Vec<Event>> {
        self.events.events_since(conv, since_seq)
    }

    /// Reply-window boundary for the MCP bridge.
    pub fn last_message_seq_by(&self, conv: i64, agent_id: &str) -> Result<u64> {
        self.events.last_message_seq_by(conv, agent_id)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Attachments
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn put_attachment(&self, att: NewAttachment) -> Result<String> {
        self.attachments.put(att)
    }

    pub fn attachment(&self, id: &str) -> Result<Option<Attachment>> {
        self.attachments.get(id)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Subscriptions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Register a live subscriber. Taken under the conversation lock so a
    /// subscriber that exists before an `append` returns is guaranteed to
    /// see that append.
    pub fn subscribe(&self, conv: i64, include_guidance: bool) -> Result<Subscription> {
        self.conversations.get(conv)?;
        Ok(self.locks.with(conv, || self.hub.subscribe(conv, include_guidance)))
    }

    /// Register a subscriber and atomically read the backlog after
    /// `since_seq`: no event is missed or duplicated across the seam.
    pub fn subscribe_with_backfill(
        &self,
        conv: i64,
        since_seq: u64,
        include_guidance: bool,
    ) -> Result<(Vec<Event>, Subscription)> {
        self.conversations.get(conv)?;
        self.locks.with(conv, || {
            let sub = self.hub.subscribe(conv, include_guidance);
            let mut backlog = self.events.events_since(conv, since_seq)?;
            if !include_guidance {
                backlog.retain(|e| e.event_type != EventType::Guidance);
            }
            Ok((backlog, sub))
        })
    }

    pub fn subscribe_conversations(&self) -> FirehoseSubscription {
        self.hub.subscribe_conversations()
    }

    /// Long-poll: the first event after `since_seq` matching `predicate`,
    /// or `None` on timeout. Cancellation (dropping the future) and
    /// timeout both unregister the temporary subscriber deterministically.
    pub async fn wait_for_event(
        &self,
        conv: i64,
        since_seq: u64,
        predicate: impl Fn(&Event) -> bool,
        timeout: Duration,
    ) -> Result<Option<Event>> {
        // Register first, then scan the backlog: an event landing between
        // the two shows up in the queue, never in a gap.
        let (backlog, mut sub) = self.subscribe_with_backfill(conv, since_seq, true)?;
        if let Some(hit) = backlog.into_iter().find(|e| predicate(e)) {
            return Ok(Some(hit));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, sub.recv()).await {
                Ok(Some(event)) if event.seq > since_seq && predicate(&event) => {
                    return Ok(Some(event));
                }
                Ok(Some(_)) => continue,
                // Hub dropped us (overflow) — report a clean miss.
                Ok(None) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Checks
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn check_participant(&self, conv: i64, agent_id: &str) -> Result<()> {
        if agent_id == SYSTEM_AGENT {
            return Ok(());
        }
        let row = self.conversations.get(conv)?;
        if !row.metadata.has_agent(agent_id) {
            return Err(Error::AgentNotPermitted(agent_id.to_owned()));
        }
        Ok(())
    }

    fn check_payload_size(&self, payload: &EventPayload) -> Result<()> {
        let size = serde_json::to_vec(payload)?.len();
        if size > self.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                max: self.max_payload_bytes,
            });
        }
        Ok(())
    }
}

/// Generate an id for tool calls and similar correlation handles.
pub fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}
