//! Tool synthesis — inventing tool results.
//!
//! Scenario tools have no real backend. When an agent calls one, the
//! host asks the synthesis service for a plausible result, steered by the
//! tool's `synthesis_guidance`, the call arguments, the agent persona,
//! and the conversation so far.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use parley_domain::{Error, Result, ScenarioAgent, ScenarioTool};
use parley_providers::{ChatMessage, GenerateRequest, LlmProvider};

pub struct SynthesisRequest<'a> {
    pub tool_name: &'a str,
    pub tool: Option<&'a ScenarioTool>,
    pub args: &'a Value,
    pub agent: Option<&'a ScenarioAgent>,
    /// Rendered conversation transcript.
    pub history: String,
}

#[async_trait::async_trait]
pub trait ToolSynthesizer: Send + Sync {
    async fn synthesize(&self, req: &SynthesisRequest<'_>) -> Result<Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM-backed synthesizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmSynthesizer {
    provider: Arc<dyn LlmProvider>,
}

impl LlmSynthesizer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl ToolSynthesizer for LlmSynthesizer {
    async fn synthesize(&self, req: &SynthesisRequest<'_>) -> Result<Value> {
        let mut prompt = format!(
            "You simulate the backend of the tool '{}'. Produce a realistic result \
             for the call below as a single JSON value, nothing else.\n",
            req.tool_name
        );
        if let Some(tool) = req.tool {
            if !tool.description.is_empty() {
                prompt.push_str(&format!("Tool description: {}\n", tool.description));
            }
            if !tool.synthesis_guidance.is_empty() {
                prompt.push_str(&format!("Guidance: {}\n", tool.synthesis_guidance));
            }
        }
        if let Some(agent) = req.agent {
            if !agent.situation.is_empty() {
                prompt.push_str(&format!("Caller situation: {}\n", agent.situation));
            }
        }
        prompt.push_str(&format!("Arguments: {}\n", req.args));
        if !req.history.is_empty() {
            prompt.push_str(&format!("Conversation so far:\n{}\n", req.history));
        }

        let response = self
            .provider
            .generate(&GenerateRequest {
                messages: vec![
                    ChatMessage::system("You are a tool result synthesizer.".to_owned()),
                    ChatMessage::user(prompt),
                ],
                model: None,
                temperature: None,
                max_tokens: None,
            })
            .await?;

        let trimmed = response
            .content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_owned();
        // Non-JSON output is still a usable result — wrap it.
        Ok(serde_json::from_str(&trimmed)
            .unwrap_or_else(|_| serde_json::json!({ "output": trimmed })))
    }
}

/// Synthesizer used when no provider is configured: every call errors,
/// which the worker surfaces as a tool failure and a surrendered turn.
pub struct NoProviderSynthesizer;

#[async_trait::async_trait]
impl ToolSynthesizer for NoProviderSynthesizer {
    async fn synthesize(&self, req: &SynthesisRequest<'_>) -> Result<Value> {
        Err(Error::Fatal(format!(
            "cannot synthesize '{}': no LLM provider configured",
            req.tool_name
        )))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted synthesizer (tests)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ScriptedSynthesizer {
    results: Mutex<VecDeque<Result<Value>>>,
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Value) -> &Self {
        self.results.lock().push_back(Ok(result));
        self
    }

    pub fn push_err(&self, err: Error) -> &Self {
        self.results.lock().push_back(Err(err));
        self
    }
}

#[async_trait::async_trait]
impl ToolSynthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, _req: &SynthesisRequest<'_>) -> Result<Value> {
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Fatal("scripted synthesizer exhausted".into())))
    }
}
