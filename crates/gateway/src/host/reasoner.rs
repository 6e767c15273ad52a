//! The reasoning seam — how a hosted agent decides its next step.
//!
//! The worker loop drives an [`AgentReasoner`]; the built-in
//! [`LlmReasoner`] prompts a provider for one JSON action per step and
//! validates it at this boundary, so the rest of the host only ever sees
//! typed [`AgentStep`]s. Tests swap in [`ScriptedReasoner`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use parley_domain::{
    ConversationMeta, Error, Event, EventPayload, EventType, Finality, Result, ScenarioAgent,
    TracePayload,
};
use parley_providers::{ChatMessage, GenerateRequest, LlmProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps and context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One decision by the agent within its turn.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    Thought {
        content: String,
    },
    ToolCall {
        name: String,
        args: Value,
    },
    Message {
        text: String,
        finality: Finality,
    },
}

/// Everything the reasoner may look at when choosing the next step.
pub struct TurnContext<'a> {
    pub agent_id: &'a str,
    pub meta: &'a ConversationMeta,
    pub scenario_agent: Option<&'a ScenarioAgent>,
    /// The conversation log observed so far (all event types).
    pub history: &'a [Event],
    /// Steps already taken within the current turn.
    pub steps_this_turn: &'a [AgentStep],
}

#[async_trait::async_trait]
pub trait AgentReasoner: Send + Sync {
    async fn next_step(&self, ctx: &TurnContext<'_>) -> Result<AgentStep>;
}

/// Builds one reasoner per hosted worker.
pub trait ReasonerFactory: Send + Sync {
    fn build(
        &self,
        agent_id: &str,
        meta: &ConversationMeta,
        agent: Option<&ScenarioAgent>,
    ) -> Arc<dyn AgentReasoner>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flatten the event log into a textual transcript for prompts.
pub fn render_history(events: &[Event]) -> String {
    let mut out = String::new();
    for event in events {
        match (&event.payload, event.event_type) {
            (EventPayload::Message(m), EventType::Message) => {
                out.push_str(&format!("{}: {}\n", event.agent_id, m.text));
            }
            (EventPayload::Trace(TracePayload::ToolCall { name, args, .. }), _) => {
                out.push_str(&format!("{} called {}({})\n", event.agent_id, name, args));
            }
            (EventPayload::Trace(TracePayload::ToolResult { result, error, .. }), _) => {
                match error {
                    Some(err) => out.push_str(&format!("tool error: {err}\n")),
                    None => out.push_str(&format!("tool result: {result}\n")),
                }
            }
            _ => {}
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM-backed reasoner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmReasoner {
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
}

impl LlmReasoner {
    pub fn new(provider: Arc<dyn LlmProvider>, model: Option<String>) -> Self {
        Self { provider, model }
    }

    fn system_prompt(ctx: &TurnContext<'_>) -> String {
        let mut prompt = String::new();
        if let Some(agent) = ctx.scenario_agent {
            if !agent.system_prompt.is_empty() {
                prompt.push_str(&agent.system_prompt);
                prompt.push('\n');
            }
            if !agent.situation.is_empty() {
                prompt.push_str(&format!("Situation: {}\n", agent.situation));
            }
            if !agent.goals.is_empty() {
                prompt.push_str(&format!("Goals: {}\n", agent.goals.join("; ")));
            }
            if !agent.tools.is_empty() {
                prompt.push_str("Available tools:\n");
                for tool in &agent.tools {
                    prompt.push_str(&format!("- {}: {}\n", tool.tool_name, tool.description));
                }
            }
        } else {
            prompt.push_str(&format!(
                "You are agent '{}' in a multi-party conversation.\n",
                ctx.agent_id
            ));
        }
        prompt.push_str(
            "\nRespond with exactly one JSON object and nothing else. One of:\n\
             {\"action\":\"message\",\"text\":\"...\",\"endTurn\":true}\n\
             {\"action\":\"thought\",\"content\":\"...\"}\n\
             {\"action\":\"tool_call\",\"name\":\"...\",\"args\":{...}}\n\
             Set endTurn to false only when you will immediately follow up.",
        );
        prompt
    }

    /// Parse a model response into a step. Non-JSON output degrades to a
    /// turn-ending message rather than failing the turn.
    fn parse_step(content: &str) -> AgentStep {
        let trimmed = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        let parsed: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                return AgentStep::Message {
                    text: content.trim().to_owned(),
                    finality: Finality::Turn,
                }
            }
        };
        match parsed.get("action").and_then(Value::as_str) {
            Some("thought") => AgentStep::Thought {
                content: parsed
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            },
            Some("tool_call") => AgentStep::ToolCall {
                name: parsed
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                args: parsed.get("args").cloned().unwrap_or(Value::Null),
            },
            _ => {
                let text = parsed
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or(trimmed)
                    .to_owned();
                let end_turn = parsed
                    .get("endTurn")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                AgentStep::Message {
                    text,
                    finality: if end_turn { Finality::Turn } else { Finality::None },
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl AgentReasoner for LlmReasoner {
    async fn next_step(&self, ctx: &TurnContext<'_>) -> Result<AgentStep> {
        let mut messages = vec![ChatMessage::system(Self::system_prompt(ctx))];
        let mut transcript = render_history(ctx.history);
        if !ctx.steps_this_turn.is_empty() {
            transcript.push_str("\n(Steps already taken this turn:)\n");
            for step in ctx.steps_this_turn {
                match step {
                    AgentStep::Thought { content } => {
                        transcript.push_str(&format!("thought: {content}\n"));
                    }
                    AgentStep::ToolCall { name, .. } => {
                        transcript.push_str(&format!("tool call: {name}\n"));
                    }
                    AgentStep::Message { text, .. } => {
                        transcript.push_str(&format!("said: {text}\n"));
                    }
                }
            }
        }
        if transcript.is_empty() {
            transcript.push_str("(The conversation has not started. You speak first.)");
        }
        messages.push(ChatMessage::user(transcript));

        let response = self
            .provider
            .generate(&GenerateRequest {
                messages,
                model: self.model.clone(),
                temperature: None,
                max_tokens: None,
            })
            .await?;
        Ok(Self::parse_step(&response.content))
    }
}

/// Default factory: every hosted agent reasons through the configured
/// provider. A missing provider yields a reasoner that fails fatally,
/// which the worker reports once and then surrenders its turn.
pub struct LlmReasonerFactory {
    provider: Option<Arc<dyn LlmProvider>>,
}

impl LlmReasonerFactory {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self { provider }
    }
}

impl ReasonerFactory for LlmReasonerFactory {
    fn build(
        &self,
        agent_id: &str,
        meta: &ConversationMeta,
        _agent: Option<&ScenarioAgent>,
    ) -> Arc<dyn AgentReasoner> {
        match &self.provider {
            Some(provider) => {
                let model = meta
                    .agents
                    .iter()
                    .find(|d| d.id == agent_id)
                    .and_then(|d| d.model.clone());
                Arc::new(LlmReasoner::new(provider.clone(), model))
            }
            None => Arc::new(NoProviderReasoner),
        }
    }
}

struct NoProviderReasoner;

#[async_trait::async_trait]
impl AgentReasoner for NoProviderReasoner {
    async fn next_step(&self, _ctx: &TurnContext<'_>) -> Result<AgentStep> {
        Err(Error::Fatal("no LLM provider configured".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted reasoner (tests)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replays a queue of steps; fails fatally when the script runs dry.
#[derive(Default)]
pub struct ScriptedReasoner {
    steps: Mutex<VecDeque<Result<AgentStep>>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: AgentStep) -> &Self {
        self.steps.lock().push_back(Ok(step));
        self
    }

    pub fn push_err(&self, err: Error) -> &Self {
        self.steps.lock().push_back(Err(err));
        self
    }
}

#[async_trait::async_trait]
impl AgentReasoner for ScriptedReasoner {
    async fn next_step(&self, _ctx: &TurnContext<'_>) -> Result<AgentStep> {
        self.steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Fatal("scripted reasoner exhausted".into())))
    }
}

/// Factory that hands each agent id its pre-registered scripted reasoner.
#[derive(Default)]
pub struct ScriptedReasonerFactory {
    by_agent: Mutex<std::collections::HashMap<String, Arc<ScriptedReasoner>>>,
}

impl ScriptedReasonerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: &str) -> Arc<ScriptedReasoner> {
        let reasoner = Arc::new(ScriptedReasoner::new());
        self.by_agent
            .lock()
            .insert(agent_id.to_owned(), reasoner.clone());
        reasoner
    }
}

impl ReasonerFactory for ScriptedReasonerFactory {
    fn build(
        &self,
        agent_id: &str,
        _meta: &ConversationMeta,
        _agent: Option<&ScenarioAgent>,
    ) -> Arc<dyn AgentReasoner> {
        if let Some(r) = self.by_agent.lock().get(agent_id) {
            return r.clone();
        }
        Arc::new(ScriptedReasoner::new())
    }
}
