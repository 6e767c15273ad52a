//! Scenarios — versioned configuration describing personas, tools, and
//! knowledge for each agent in a conversation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioMetadata {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioBackground {
    #[serde(default)]
    pub background: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub challenges: Vec<String>,
}

/// A synthesized tool available to one scenario agent. Results are not
/// produced by real integrations; the tool synthesis service invents them
/// from `synthesis_guidance`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioTool {
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub synthesis_guidance: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ends_conversation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_end_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioAgent {
    pub agent_id: String,
    #[serde(default)]
    pub principal: Value,
    #[serde(default)]
    pub situation: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ScenarioTool>,
    #[serde(default)]
    pub knowledge_base: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_to_use_when_initiating_conversation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub metadata: ScenarioMetadata,
    #[serde(default)]
    pub scenario: ScenarioBackground,
    #[serde(default)]
    pub agents: Vec<ScenarioAgent>,
}

impl Default for ScenarioAgent {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            principal: Value::Null,
            situation: String::new(),
            system_prompt: String::new(),
            goals: Vec::new(),
            tools: Vec::new(),
            knowledge_base: Value::Null,
            message_to_use_when_initiating_conversation: None,
        }
    }
}

impl Scenario {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn agent(&self, agent_id: &str) -> Option<&ScenarioAgent> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }
}

impl ScenarioAgent {
    pub fn tool(&self, tool_name: &str) -> Option<&ScenarioTool> {
        self.tools.iter().find(|t| t.tool_name == tool_name)
    }
}
