//! The append-only event log.
//!
//! `append` is the single write path for events. It validates the turn
//! state machine, assigns the next dense `seq`, persists the event and the
//! conversation bookkeeping in one transaction, and maintains an in-memory
//! head cache so `head()` is O(1).
//!
//! Callers (the orchestrator) serialize appends per conversation; the head
//! cache relies on that — two concurrent appends to the same conversation
//! would race between validation and commit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::{params, Connection};

use parley_domain::event::SYSTEM_AGENT;
use parley_domain::{
    ConversationStatus, Error, Event, EventPayload, EventType, Finality, Head, Result,
};

use crate::db::{fmt_ts, parse_ts, Db};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Append request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to [`EventStore::append`]. `turn: None` lets the store assign per
/// the turn rules; `Some(t)` must agree with them or the append fails with
/// `TurnMismatch`.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub event_type: EventType,
    pub finality: Finality,
    pub agent_id: String,
    pub turn: Option<u64>,
    pub payload: EventPayload,
}

#[derive(Clone)]
pub struct EventStore {
    db: Db,
    heads: Arc<RwLock<HashMap<i64, Head>>>,
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            heads: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // ── head ──────────────────────────────────────────────────────────

    /// Per-conversation turn bookkeeping, from the cache when warm.
    pub fn head(&self, conv: i64) -> Result<Head> {
        if let Some(h) = self.heads.read().get(&conv) {
            return Ok(h.clone());
        }
        let head = {
            let conn = self.db.conn();
            compute_head(&conn, conv)?
        };
        self.heads.write().insert(conv, head.clone());
        Ok(head)
    }

    // ── append ────────────────────────────────────────────────────────

    /// Validate, assign `seq`/`turn`, persist, and return the full event.
    ///
    /// The caller must hold the conversation's write lock.
    pub fn append(&self, conv: i64, req: AppendRequest) -> Result<Event> {
        let head = self.head(conv)?;

        if head.status == ConversationStatus::Completed {
            return Err(Error::ClosedConversation(conv));
        }
        if !req.payload.matches(req.event_type) {
            return Err(Error::InvalidEvent(format!(
                "payload shape does not match event type '{}'",
                req.event_type.as_str()
            )));
        }
        if req.finality != Finality::None
            && !matches!(req.event_type, EventType::Message | EventType::System)
        {
            return Err(Error::InvalidEvent(format!(
                "only message and system events may carry finality, not '{}'",
                req.event_type.as_str()
            )));
        }

        let turn = assign_turn(&head, &req)?;

        // Ownership: joining another agent's open turn is rejected. The
        // orchestrator's own appends (agent "system") are exempt.
        if head.has_open_turn
            && turn == head.last_turn
            && matches!(req.event_type, EventType::Message | EventType::Trace)
            && req.agent_id != SYSTEM_AGENT
        {
            if let Some(owner) = &head.open_turn_agent {
                if *owner != req.agent_id {
                    return Err(Error::WrongAgent {
                        agent: req.agent_id.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        let seq = head.last_seq + 1;
        let ts = Utc::now();
        let event = Event {
            conversation: conv,
            seq,
            turn,
            event_type: req.event_type,
            finality: req.finality,
            agent_id: req.agent_id,
            ts,
            payload: req.payload,
        };

        // Persist event + conversation bookkeeping atomically.
        {
            let mut conn = self.db.conn();
            let tx = conn.transaction().map_err(Error::db)?;
            tx.execute(
                "INSERT INTO events
                   (conversation, seq, turn, type, finality, agent_id, ts, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    conv,
                    seq as i64,
                    turn as i64,
                    event.event_type.as_str(),
                    event.finality.as_str(),
                    event.agent_id,
                    fmt_ts(ts),
                    serde_json::to_string(&event.payload)?,
                ],
            )
            .map_err(Error::db)?;
            if req.finality == Finality::Conversation {
                tx.execute(
                    "UPDATE conversations SET updated_at = ?2, status = 'completed' WHERE id = ?1",
                    params![conv, fmt_ts(ts)],
                )
                .map_err(Error::db)?;
            } else {
                tx.execute(
                    "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                    params![conv, fmt_ts(ts)],
                )
                .map_err(Error::db)?;
            }
            tx.commit().map_err(Error::db)?;
        }

        self.heads.write().insert(conv, advance_head(head, &event));
        Ok(event)
    }

    // ── reads ─────────────────────────────────────────────────────────

    /// Events with `seq > since_seq`, ascending, up to `limit`.
    pub fn events_page(&self, conv: i64, since_seq: u64, limit: usize) -> Result<Vec<Event>> {
        self.query_events(conv, since_seq, Some(limit))
    }

    /// Unbounded variant used by internal fan-out and snapshots.
    pub fn events_since(&self, conv: i64, since_seq: u64) -> Result<Vec<Event>> {
        self.query_events(conv, since_seq, None)
    }

    /// `seq` of the most recent `message` event authored by `agent_id`,
    /// or 0. The MCP bridge's reply-window boundary.
    pub fn last_message_seq_by(&self, conv: i64, agent_id: &str) -> Result<u64> {
        let conn = self.db.conn();
        let seq: Option<i64> = conn
            .query_row(
                "SELECT MAX(seq) FROM events
                 WHERE conversation = ?1 AND type = 'message' AND agent_id = ?2",
                params![conv, agent_id],
                |row| row.get(0),
            )
            .map_err(Error::db)?;
        Ok(seq.unwrap_or(0) as u64)
    }

    fn query_events(&self, conv: i64, since_seq: u64, limit: Option<usize>) -> Result<Vec<Event>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(
                "SELECT conversation, seq, turn, type, finality, agent_id, ts, payload_json
                 FROM events
                 WHERE conversation = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3",
            )
            .map_err(Error::db)?;
        let rows = stmt
            .query_map(
                params![conv, since_seq as i64, limit.map_or(i64::MAX, |l| l as i64)],
                row_to_event,
            )
            .map_err(Error::db)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::db)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn assignment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve the turn an append lands on, per the state-machine rules:
/// guidance is always turn 0; system defaults to 0 but may explicitly
/// target the open turn or `last_turn+1` (cancellation placement);
/// message/trace reuse the open turn or open `last_turn+1`.
fn assign_turn(head: &Head, req: &AppendRequest) -> Result<u64> {
    match req.event_type {
        EventType::Guidance => match req.turn {
            None | Some(0) => Ok(0),
            Some(t) => Err(Error::TurnMismatch(format!(
                "guidance events live on turn 0, got {t}"
            ))),
        },
        EventType::System => match req.turn {
            None | Some(0) => Ok(0),
            Some(t) => {
                expect_open_or_next(head, t)?;
                Ok(t)
            }
        },
        EventType::Message | EventType::Trace => match req.turn {
            Some(t) => {
                expect_open_or_next(head, t)?;
                Ok(t)
            }
            None => {
                if head.has_open_turn {
                    Ok(head.last_turn)
                } else {
                    Ok(head.last_turn + 1)
                }
            }
        },
    }
}

fn expect_open_or_next(head: &Head, t: u64) -> Result<()> {
    let expected = if head.has_open_turn {
        head.last_turn
    } else {
        head.last_turn + 1
    };
    if t != expected {
        return Err(Error::TurnMismatch(format!(
            "expected turn {expected}, got {t}"
        )));
    }
    Ok(())
}

/// Fold a committed event into the head bookkeeping.
fn advance_head(mut head: Head, event: &Event) -> Head {
    head.last_seq = event.seq;
    if event.finality == Finality::Conversation {
        head.status = ConversationStatus::Completed;
    }
    if event.finality.closes_turn() {
        head.last_closed_seq = event.seq;
    }
    if event.touches_turn_state() {
        if event.turn > head.last_turn {
            head.last_turn = event.turn;
        }
        if event.finality.closes_turn() {
            head.has_open_turn = false;
            head.open_turn_agent = None;
        } else if !head.has_open_turn {
            head.has_open_turn = true;
            head.open_turn_agent = Some(event.agent_id.clone());
        }
    } else if event.finality == Finality::Conversation {
        // A turn-0 terminal marker: nothing further may append, so any
        // open turn is moot. Clear it for consistency.
        head.has_open_turn = false;
        head.open_turn_agent = None;
    }
    head
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping and head recovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let ty: String = row.get(3)?;
    let finality: String = row.get(4)?;
    let ts: String = row.get(6)?;
    let payload_json: String = row.get(7)?;
    let fail =
        |e: Error| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e));
    Ok(Event {
        conversation: row.get(0)?,
        seq: row.get::<_, i64>(1)? as u64,
        turn: row.get::<_, i64>(2)? as u64,
        event_type: EventType::parse(&ty).map_err(fail)?,
        finality: Finality::parse(&finality).map_err(fail)?,
        agent_id: row.get(5)?,
        ts: parse_ts(&ts).map_err(fail)?,
        payload: serde_json::from_str(&payload_json).map_err(|e| fail(Error::from(e)))?,
    })
}

/// Rebuild the head from persisted rows (cold cache, e.g. after restart).
fn compute_head(conn: &Connection, conv: i64) -> Result<Head> {
    let status: String = conn
        .query_row(
            "SELECT status FROM conversations WHERE id = ?1",
            params![conv],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("conversation {conv}")),
            other => Error::db(other),
        })?;

    let last_seq: Option<i64> = conn
        .query_row(
            "SELECT MAX(seq) FROM events WHERE conversation = ?1",
            params![conv],
            |row| row.get(0),
        )
        .map_err(Error::db)?;

    let last_turn: Option<i64> = conn
        .query_row(
            "SELECT MAX(turn) FROM events
             WHERE conversation = ?1 AND turn > 0 AND type IN ('message','trace','system')",
            params![conv],
            |row| row.get(0),
        )
        .map_err(Error::db)?;
    let last_turn = last_turn.unwrap_or(0) as u64;

    let last_closed_seq: Option<i64> = conn
        .query_row(
            "SELECT MAX(seq) FROM events WHERE conversation = ?1 AND finality != 'none'",
            params![conv],
            |row| row.get(0),
        )
        .map_err(Error::db)?;

    let mut head = Head {
        last_seq: last_seq.unwrap_or(0) as u64,
        last_turn,
        has_open_turn: false,
        last_closed_seq: last_closed_seq.unwrap_or(0) as u64,
        status: ConversationStatus::parse(&status)?,
        open_turn_agent: None,
    };

    if last_turn > 0 && head.status == ConversationStatus::Active {
        let closed: bool = conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM events
                    WHERE conversation = ?1 AND turn = ?2 AND finality != 'none')",
                params![conv, last_turn as i64],
                |row| row.get(0),
            )
            .map_err(Error::db)?;
        if !closed {
            let owner: String = conn
                .query_row(
                    "SELECT agent_id FROM events
                     WHERE conversation = ?1 AND turn = ?2
                     ORDER BY seq ASC LIMIT 1",
                    params![conv, last_turn as i64],
                    |row| row.get(0),
                )
                .map_err(Error::db)?;
            head.has_open_turn = true;
            head.open_turn_agent = Some(owner);
        }
    }

    Ok(head)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationStore;
    use parley_domain::{AgentDescriptor, ConversationMeta, MessagePayload, SystemPayload, TracePayload};

    fn setup() -> (EventStore, ConversationStore, i64) {
        let db = Db::open_in_memory().unwrap();
        let convs = ConversationStore::new(db.clone());
        let events = EventStore::new(db);
        let meta = ConversationMeta {
            agents: vec![AgentDescriptor::new("a"), AgentDescriptor::new("b")],
            ..Default::default()
        };
        let conv = convs.create(&meta).unwrap();
        (events, convs, conv)
    }

    fn msg(agent: &str, text: &str, finality: Finality) -> AppendRequest {
        AppendRequest {
            event_type: EventType::Message,
            finality,
            agent_id: agent.into(),
            turn: None,
            payload: EventPayload::Message(MessagePayload::text(text)),
        }
    }

    fn thought(agent: &str) -> AppendRequest {
        AppendRequest {
            event_type: EventType::Trace,
            finality: Finality::None,
            agent_id: agent.into(),
            turn: None,
            payload: EventPayload::Trace(TracePayload::Thought {
                content: "hm".into(),
            }),
        }
    }

    #[test]
    fn seq_is_dense_and_turns_advance() {
        let (events, _, conv) = setup();
        let e1 = events.append(conv, msg("a", "hi", Finality::Turn)).unwrap();
        assert_eq!((e1.seq, e1.turn), (1, 1));
        let e2 = events.append(conv, msg("b", "hello", Finality::Turn)).unwrap();
        assert_eq!((e2.seq, e2.turn), (2, 2));
        let head = events.head(conv).unwrap();
        assert_eq!(head.last_closed_seq, 2);
        assert!(!head.has_open_turn);
    }

    #[test]
    fn open_turn_is_reused_until_closed() {
        let (events, _, conv) = setup();
        let e1 = events.append(conv, msg("a", "part 1", Finality::None)).unwrap();
        assert_eq!((e1.seq, e1.turn), (1, 1));
        let e2 = events.append(conv, thought("a")).unwrap();
        assert_eq!((e2.seq, e2.turn), (2, 1));
        let e3 = events.append(conv, msg("a", "done", Finality::Turn)).unwrap();
        assert_eq!((e3.seq, e3.turn), (3, 1));
        assert!(!events.head(conv).unwrap().has_open_turn);
    }

    #[test]
    fn joining_anothers_open_turn_is_wrong_agent() {
        let (events, _, conv) = setup();
        events.append(conv, msg("a", "part 1", Finality::None)).unwrap();
        let err = events.append(conv, thought("b")).unwrap_err();
        assert!(matches!(err, Error::WrongAgent { .. }), "{err}");
        // The owner may continue.
        events.append(conv, thought("a")).unwrap();
    }

    #[test]
    fn explicit_turn_must_match() {
        let (events, _, conv) = setup();
        events.append(conv, msg("a", "opens turn 1", Finality::Turn)).unwrap();
        let mut req = msg("b", "wrong turn", Finality::Turn);
        req.turn = Some(5);
        assert!(matches!(
            events.append(conv, req).unwrap_err(),
            Error::TurnMismatch(_)
        ));
        let mut ok = msg("b", "right turn", Finality::Turn);
        ok.turn = Some(2);
        assert_eq!(events.append(conv, ok).unwrap().turn, 2);
    }

    #[test]
    fn explicit_next_turn_opens_for_trace() {
        let (events, _, conv) = setup();
        events.append(conv, msg("a", "t1", Finality::Turn)).unwrap();
        let mut req = thought("b");
        req.turn = Some(2);
        let e = events.append(conv, req).unwrap();
        assert_eq!(e.turn, 2);
        let head = events.head(conv).unwrap();
        assert!(head.has_open_turn);
        assert_eq!(head.open_turn_agent.as_deref(), Some("b"));
    }

    #[test]
    fn guidance_and_system_live_on_turn_zero() {
        let (events, _, conv) = setup();
        events.append(conv, msg("a", "open", Finality::None)).unwrap();
        let g = events
            .append(
                conv,
                AppendRequest {
                    event_type: EventType::Guidance,
                    finality: Finality::None,
                    agent_id: SYSTEM_AGENT.into(),
                    turn: None,
                    payload: EventPayload::Guidance(parley_domain::GuidancePayload {
                        next_agent_id: "b".into(),
                        deadline_ms: 5000,
                        kind: "turn_hint".into(),
                    }),
                },
            )
            .unwrap();
        assert_eq!(g.turn, 0);
        // Turn state untouched: a's turn 1 is still open.
        let head = events.head(conv).unwrap();
        assert!(head.has_open_turn);
        assert_eq!(head.last_turn, 1);
    }

    #[test]
    fn conversation_finality_closes_everything() {
        let (events, convs, conv) = setup();
        events.append(conv, msg("a", "open", Finality::None)).unwrap();
        events
            .append(
                conv,
                AppendRequest {
                    event_type: EventType::System,
                    finality: Finality::Conversation,
                    agent_id: SYSTEM_AGENT.into(),
                    turn: Some(1),
                    payload: EventPayload::System(SystemPayload {
                        kind: "cancelled".into(),
                        data: serde_json::Value::Null,
                    }),
                },
            )
            .unwrap();
        assert_eq!(
            convs.get(conv).unwrap().status,
            ConversationStatus::Completed
        );
        assert!(matches!(
            events.append(conv, msg("a", "too late", Finality::None)).unwrap_err(),
            Error::ClosedConversation(_)
        ));
    }

    #[test]
    fn trace_finality_is_rejected() {
        let (events, _, conv) = setup();
        events.append(conv, msg("a", "open", Finality::None)).unwrap();
        let mut req = thought("a");
        req.finality = Finality::Turn;
        assert!(matches!(
            events.append(conv, req).unwrap_err(),
            Error::InvalidEvent(_)
        ));
    }

    #[test]
    fn head_survives_cache_loss() {
        let (events, _, conv) = setup();
        events.append(conv, msg("a", "one", Finality::Turn)).unwrap();
        events.append(conv, msg("b", "two", Finality::None)).unwrap();
        let warm = events.head(conv).unwrap();

        // Fresh store over the same connection: cold cache, recomputed head.
        let cold = EventStore {
            db: events.db.clone(),
            heads: Arc::new(RwLock::new(HashMap::new())),
        };
        let recovered = cold.head(conv).unwrap();
        assert_eq!(recovered, warm);
        assert!(recovered.has_open_turn);
        assert_eq!(recovered.open_turn_agent.as_deref(), Some("b"));
        assert_eq!(recovered.last_closed_seq, 1);
    }

    #[test]
    fn last_closed_seq_is_per_conversation() {
        let db = Db::open_in_memory().unwrap();
        let convs = ConversationStore::new(db.clone());
        let events = EventStore::new(db);
        let meta = ConversationMeta {
            agents: vec![AgentDescriptor::new("a")],
            ..Default::default()
        };
        let c1 = convs.create(&meta).unwrap();
        let c2 = convs.create(&meta).unwrap();
        events.append(c1, msg("a", "hi", Finality::Turn)).unwrap();
        assert_eq!(events.head(c1).unwrap().last_closed_seq, 1);
        assert_eq!(events.head(c2).unwrap().last_closed_seq, 0);
    }

    #[test]
    fn pages_are_ascending_and_bounded() {
        let (events, _, conv) = setup();
        for i in 0..5 {
            events.append(conv, msg("a", &format!("m{i}"), Finality::Turn)).unwrap();
        }
        let page = events.events_page(conv, 1, 2).unwrap();
        assert_eq!(page.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        let rest = events.events_since(conv, 3).unwrap();
        assert_eq!(rest.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn last_message_seq_by_agent() {
        let (events, _, conv) = setup();
        assert_eq!(events.last_message_seq_by(conv, "a").unwrap(), 0);
        events.append(conv, msg("a", "one", Finality::Turn)).unwrap();
        events.append(conv, msg("b", "two", Finality::Turn)).unwrap();
        events.append(conv, msg("a", "three", Finality::Turn)).unwrap();
        assert_eq!(events.last_message_seq_by(conv, "a").unwrap(), 3);
        assert_eq!(events.last_message_seq_by(conv, "b").unwrap(), 2);
    }
}
