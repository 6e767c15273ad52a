//! The hosted-agent worker loop.
//!
//! One worker per `(conversation, agent)` pair. The worker watches the
//! event stream, derives "my turn" strictly from the log (no central
//! scheduler), and composes turns through its reasoner. Scheduling races
//! between multiple hosts resolve through the orchestrator's ownership
//! rules: whoever appends first wins, the loser observes `WrongAgent`
//! and goes back to watching.

use std::sync::Arc;

use tracing::Instrument;

use parley_domain::config::RetryConfig;
use parley_domain::{
    ConversationMeta, Error, Event, EventPayload, EventType, Finality, MessagePayload, Result,
    ScenarioAgent, TracePayload,
};
use parley_orchestrator::{new_call_id, Orchestrator, Subscription};
use parley_providers::with_backoff;
use parley_store::RegistryStore;

use super::cancel::CancelToken;
use super::reasoner::{render_history, AgentReasoner, AgentStep, TurnContext};
use super::synthesis::{SynthesisRequest, ToolSynthesizer};

/// Spoken when the agent cannot finish its turn properly.
const FALLBACK_TEXT: &str = "I ran into a problem on my side and have to stop here for now.";

#[derive(Clone)]
pub struct WorkerConfig {
    pub retry: RetryConfig,
    pub max_steps_per_turn: u32,
}

pub struct Worker {
    pub conv: i64,
    pub agent_id: String,
    pub orch: Arc<Orchestrator>,
    pub registry: RegistryStore,
    pub meta: ConversationMeta,
    pub scenario_agent: Option<ScenarioAgent>,
    pub reasoner: Arc<dyn AgentReasoner>,
    pub synthesizer: Arc<dyn ToolSynthesizer>,
    pub config: WorkerConfig,
    pub cancel: CancelToken,
}

enum TurnOutcome {
    /// The turn was closed (normally or via fallback).
    Closed,
    /// Someone else closed or took the turn; go back to watching.
    Abandoned,
    /// A terminal message ended the conversation.
    ConversationEnded,
    /// Unrecoverable worker-level condition; the worker exits and the
    /// lifecycle row stays in place.
    HardError(Error),
}

impl Worker {
    pub async fn run(self) {
        let span = tracing::info_span!(
            "agent_worker",
            conversation = self.conv,
            agent = %self.agent_id,
        );
        async move {
            tracing::debug!("worker started");
            match self.run_inner().await {
                Ok(()) => tracing::debug!("worker finished"),
                Err(e) => tracing::error!(error = %e, "worker exited on hard error"),
            }
        }
        .instrument(span)
        .await;
    }

    async fn run_inner(&self) -> Result<()> {
        let (backlog, mut sub) = self.orch.subscribe_with_backfill(self.conv, 0, true)?;
        let mut log = backlog;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if conversation_completed(&log) {
                // Rows are deleted on conversation completion.
                if let Err(e) = self.registry.stop(self.conv) {
                    tracing::warn!(error = %e, "registry cleanup failed");
                }
                return Ok(());
            }

            if self.should_act(&log) {
                match self.compose_turn(&mut log, &mut sub).await {
                    TurnOutcome::Closed | TurnOutcome::Abandoned => {}
                    TurnOutcome::ConversationEnded => {
                        if let Err(e) = self.registry.stop(self.conv) {
                            tracing::warn!(error = %e, "registry cleanup failed");
                        }
                        return Ok(());
                    }
                    TurnOutcome::HardError(e) => return Err(e),
                }
                drain(&mut sub, &mut log);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = sub.recv() => match event {
                    Some(e) => {
                        log.push(e);
                        drain(&mut sub, &mut log);
                    }
                    None => {
                        // The hub dropped us (overflow). Resubscribe and
                        // backfill the gap.
                        let since = log.last().map_or(0, |e| e.seq);
                        let (missed, fresh) =
                            self.orch.subscribe_with_backfill(self.conv, since, true)?;
                        tracing::warn!(missed = missed.len(), "resubscribed after overflow");
                        log.extend(missed);
                        sub = fresh;
                    }
                }
            }
        }
    }

    /// Turn ownership, derived from the log alone.
    fn should_act(&self, log: &[Event]) -> bool {
        if let Some(owner) = open_turn_owner(log) {
            // Resume composing only into our own open turn.
            return owner == self.agent_id;
        }
        is_my_turn(log, &self.agent_id, self.meta.starting_agent_id.as_deref())
    }

    // ── Turn composition ──────────────────────────────────────────────

    async fn compose_turn(&self, log: &mut Vec<Event>, sub: &mut Subscription) -> TurnOutcome {
        let head = match self.orch.head(self.conv) {
            Ok(h) => h,
            Err(e) => return TurnOutcome::HardError(e),
        };
        let turn = if head.has_open_turn {
            head.last_turn
        } else {
            head.last_turn + 1
        };

        // A starting agent with a canned opener sends it verbatim.
        let log_is_empty = !log.iter().any(|e| e.event_type != EventType::Guidance);
        if log_is_empty && self.meta.starting_agent_id.as_deref() == Some(&self.agent_id) {
            if let Some(text) = self
                .scenario_agent
                .as_ref()
                .and_then(|a| a.message_to_use_when_initiating_conversation.clone())
            {
                return self.send(turn, text, Finality::Turn);
            }
        }

        let mut steps: Vec<AgentStep> = Vec::new();
        for _ in 0..self.config.max_steps_per_turn {
            if self.cancel.is_cancelled() {
                return TurnOutcome::Abandoned;
            }
            if self.drain_sees_abort(log, sub, turn) {
                return TurnOutcome::Abandoned;
            }

            let step = {
                let ctx = TurnContext {
                    agent_id: &self.agent_id,
                    meta: &self.meta,
                    scenario_agent: self.scenario_agent.as_ref(),
                    history: log,
                    steps_this_turn: &steps,
                };
                with_backoff(&self.config.retry, "reasoner step", || {
                    self.reasoner.next_step(&ctx)
                })
                .await
            };

            match step {
                Ok(AgentStep::Thought { content }) => {
                    let posted = self.orch.post_trace(
                        self.conv,
                        &self.agent_id,
                        TracePayload::Thought {
                            content: content.clone(),
                        },
                        Some(turn),
                    );
                    if let Err(e) = posted {
                        return self.append_failed(e);
                    }
                    steps.push(AgentStep::Thought { content });
                }

                Ok(AgentStep::ToolCall { name, args }) => {
                    match self.run_tool(log, turn, &name, args.clone()).await {
                        Ok(None) => steps.push(AgentStep::ToolCall { name, args }),
                        Ok(Some(outcome)) => return outcome,
                        Err(e) => return self.append_failed(e),
                    }
                }

                Ok(AgentStep::Message { text, finality }) => {
                    match self.send(turn, text.clone(), finality) {
                        TurnOutcome::Closed if finality == Finality::None => {
                            steps.push(AgentStep::Message { text, finality });
                        }
                        outcome => return outcome,
                    }
                }

                Err(e) => {
                    // Retries exhausted (or fatal): end the turn gracefully.
                    tracing::warn!(error = %e, "reasoner failed — surrendering turn");
                    return self.send(turn, FALLBACK_TEXT.to_owned(), Finality::Turn);
                }
            }
        }

        tracing::warn!(
            max_steps = self.config.max_steps_per_turn,
            "step limit reached — closing turn"
        );
        self.send(turn, FALLBACK_TEXT.to_owned(), Finality::Turn)
    }

    /// Post the tool_call trace, synthesize, post the tool_result.
    /// `Ok(None)` means the turn continues; `Ok(Some(..))` ends it.
    async fn run_tool(
        &self,
        log: &[Event],
        turn: u64,
        name: &str,
        args: serde_json::Value,
    ) -> Result<Option<TurnOutcome>> {
        let call_id = new_call_id();
        self.orch.post_trace(
            self.conv,
            &self.agent_id,
            TracePayload::ToolCall {
                tool_call_id: call_id.clone(),
                name: name.to_owned(),
                args: args.clone(),
            },
            Some(turn),
        )?;

        let tool = self
            .scenario_agent
            .as_ref()
            .and_then(|a| a.tool(name))
            .cloned();
        let synthesized = {
            let request = SynthesisRequest {
                tool_name: name,
                tool: tool.as_ref(),
                args: &args,
                agent: self.scenario_agent.as_ref(),
                history: render_history(log),
            };
            with_backoff(&self.config.retry, "tool synthesis", || {
                self.synthesizer.synthesize(&request)
            })
            .await
        };

        match synthesized {
            Ok(result) => {
                self.orch.post_trace(
                    self.conv,
                    &self.agent_id,
                    TracePayload::ToolResult {
                        tool_call_id: call_id,
                        result,
                        error: None,
                    },
                    Some(turn),
                )?;
                if let Some(tool) = tool.filter(|t| t.ends_conversation) {
                    let status = tool
                        .conversation_end_status
                        .as_deref()
                        .unwrap_or("completed");
                    let text = format!("This conversation is now {status}. Thank you.");
                    return Ok(Some(self.send(turn, text, Finality::Conversation)));
                }
                Ok(None)
            }
            Err(e) => {
                // Surface the failure in the log, then surrender the turn.
                self.orch.post_trace(
                    self.conv,
                    &self.agent_id,
                    TracePayload::ToolResult {
                        tool_call_id: call_id,
                        result: serde_json::Value::Null,
                        error: Some(e.to_string()),
                    },
                    Some(turn),
                )?;
                Ok(Some(self.send(
                    turn,
                    FALLBACK_TEXT.to_owned(),
                    Finality::Turn,
                )))
            }
        }
    }

    fn send(&self, turn: u64, text: String, finality: Finality) -> TurnOutcome {
        match self.orch.send_message(
            self.conv,
            &self.agent_id,
            MessagePayload::text(text),
            finality,
            Some(turn),
        ) {
            Ok(_) => match finality {
                Finality::Conversation => TurnOutcome::ConversationEnded,
                _ => TurnOutcome::Closed,
            },
            Err(e) => self.append_failed(e),
        }
    }

    /// An append bounced. Turn races (someone closed or claimed the turn,
    /// or the conversation ended) mean "stand down"; anything else is a
    /// worker-fatal condition.
    fn append_failed(&self, e: Error) -> TurnOutcome {
        match e {
            Error::WrongAgent { .. }
            | Error::TurnMismatch(_)
            | Error::ClosedConversation(_)
            | Error::NoOpenTurn => {
                tracing::debug!(error = %e, "lost the turn race — standing down");
                TurnOutcome::Abandoned
            }
            other => TurnOutcome::HardError(other),
        }
    }

    /// Pull pending events into `log`; true when one of them aborts the
    /// turn being composed.
    fn drain_sees_abort(&self, log: &mut Vec<Event>, sub: &mut Subscription, turn: u64) -> bool {
        let before = log.len();
        drain(sub, log);
        log[before..].iter().any(|e| self.aborts_my_turn(e, turn))
    }

    fn aborts_my_turn(&self, event: &Event, turn: u64) -> bool {
        if event.agent_id == self.agent_id {
            return false;
        }
        if event.finality == Finality::Conversation {
            return true;
        }
        match &event.payload {
            EventPayload::Trace(
                TracePayload::TurnAborted { .. } | TracePayload::TurnCleared { .. },
            ) => event.turn == turn,
            EventPayload::System(_) => event.finality.closes_turn() && event.turn == turn,
            _ => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn drain(sub: &mut Subscription, log: &mut Vec<Event>) {
    while let Ok(event) = sub.rx.try_recv() {
        log.push(event);
    }
}

pub fn conversation_completed(log: &[Event]) -> bool {
    log.iter().any(|e| e.finality == Finality::Conversation)
}

/// Fold the log into the current open turn's owner, if any.
pub fn open_turn_owner(log: &[Event]) -> Option<&str> {
    let mut open: Option<&str> = None;
    for event in log {
        if !event.touches_turn_state() {
            continue;
        }
        if event.finality.closes_turn() {
            open = None;
        } else if open.is_none() {
            open = Some(event.agent_id.as_str());
        }
    }
    open
}

/// The "my turn" rules, in order:
/// (a) empty log and I am the starting agent;
/// (c) the latest guidance with no turn-closing event after it nominates
///     somebody — that nomination decides;
/// (b) otherwise, the most recent non-guidance event closed a turn and
///     was authored by someone else.
pub fn is_my_turn(log: &[Event], agent_id: &str, starting_agent: Option<&str>) -> bool {
    if conversation_completed(log) {
        return false;
    }

    let last_real = log.iter().rev().find(|e| e.event_type != EventType::Guidance);
    if last_real.is_none() {
        return starting_agent == Some(agent_id);
    }

    if let Some(guidance) = log.iter().rev().find(|e| e.event_type == EventType::Guidance) {
        let closed_after = log
            .iter()
            .any(|e| e.seq > guidance.seq && e.finality.closes_turn());
        if !closed_after {
            if let Some(g) = guidance.payload.as_guidance() {
                return g.next_agent_id == agent_id;
            }
        }
    }

    match last_real {
        Some(e) => e.finality == Finality::Turn && e.agent_id != agent_id,
        None => false,
    }
}
