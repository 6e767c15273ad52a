//! Bridge configuration tokens.
//!
//! A token is base64url-encoded JSON describing the conversation template
//! a bridge instance spawns: title, scenario, agents, and which agent the
//! external client speaks as. The SHA-256 of the raw token (base64url,
//! unpadded) is stamped into `metadata.custom.bridgeConfig64Hash` so a
//! launcher can find conversations spawned from a given template.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use parley_domain::{AgentDescriptor, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    pub agents: Vec<AgentDescriptor>,
    /// The agent the external MCP client speaks as. Everyone else in
    /// `agents` is hosted in-process.
    pub starting_agent_id: String,
}

impl BridgeTemplate {
    pub fn decode(token: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim().as_bytes())
            .map_err(|e| Error::Config(format!("bad bridge token: {e}")))?;
        let template: Self = serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("bad bridge template: {e}")))?;
        template.validate()?;
        Ok(template)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(Error::Config("bridge template has no agents".into()));
        }
        if !self.agents.iter().any(|a| a.id == self.starting_agent_id) {
            return Err(Error::Config(format!(
                "starting agent '{}' is not in the template agent list",
                self.starting_agent_id
            )));
        }
        Ok(())
    }

    /// The external client's agent id.
    pub fn external_agent(&self) -> &str {
        &self.starting_agent_id
    }

    /// Agents hosted in-process (everyone except the external one).
    pub fn internal_agents(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|a| a.id != self.starting_agent_id)
            .map(|a| a.id.clone())
            .collect()
    }
}

/// `base64url(sha256(token))`, unpadded.
pub fn config_hash(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}
