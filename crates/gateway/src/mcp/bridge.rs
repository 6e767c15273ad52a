//! Bridge core — the three tool behaviors, independent of the MCP wire.
//!
//! The external client is one nominated agent in each conversation this
//! bridge spawns. Everything it does funnels through the orchestrator;
//! raw orchestrator errors never cross the MCP boundary (see
//! [`crate::mcp::server`] for the mapping).

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use parley_domain::{
    AttachmentRef, ConversationMeta, ConversationStatus, Error, Event, EventType, Finality,
    MessagePayload, Result,
};
use parley_orchestrator::Orchestrator;
use parley_store::attachments::NewAttachment;

use crate::host::AgentHost;
use crate::mcp::guidance::{derive_guidance, BridgeStatus};
use crate::mcp::template::{config_hash, BridgeTemplate};

/// Custom-metadata key stamped on every bridge-spawned conversation.
pub const BRIDGE_HASH_KEY: &str = "bridgeConfig64Hash";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginChatResult {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInput {
    pub name: String,
    pub content_type: String,
    /// UTF-8 text, or base64 for binary content types.
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendResult {
    pub ok: bool,
    pub guidance: String,
    pub status: BridgeStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleAttachment {
    pub name: String,
    pub content_type: String,
    /// Inlined bytes: UTF-8 verbatim, base64 otherwise.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SimpleMessage {
    pub from: String,
    pub at: chrono::DateTime<chrono::Utc>,
    pub text: String,
    pub attachments: Vec<SimpleAttachment>,
}

#[derive(Debug, Serialize)]
pub struct CheckRepliesResult {
    pub messages: Vec<SimpleMessage>,
    pub guidance: String,
    pub status: BridgeStatus,
    pub conversation_ended: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Bridge {
    orch: Arc<Orchestrator>,
    host: Arc<AgentHost>,
    template: BridgeTemplate,
    token_hash: String,
}

impl Bridge {
    pub fn new(orch: Arc<Orchestrator>, host: Arc<AgentHost>, token: &str) -> Result<Self> {
        let template = BridgeTemplate::decode(token)?;
        Ok(Self {
            orch,
            host,
            template,
            token_hash: config_hash(token),
        })
    }

    pub fn template(&self) -> &BridgeTemplate {
        &self.template
    }

    /// Create a conversation from the template and start the hosted
    /// (non-external) agents. No idempotency: every call makes a new
    /// conversation.
    pub fn begin_chat_thread(&self) -> Result<BeginChatResult> {
        let mut custom = serde_json::Map::new();
        custom.insert(
            BRIDGE_HASH_KEY.to_owned(),
            serde_json::Value::String(self.token_hash.clone()),
        );
        let meta = ConversationMeta {
            title: self.template.title.clone(),
            scenario_id: self.template.scenario_id.clone(),
            agents: self.template.agents.clone(),
            starting_agent_id: Some(self.template.starting_agent_id.clone()),
            custom,
        };
        let conv = self.orch.create_conversation(meta)?;

        let internal = self.template.internal_agents();
        if !internal.is_empty() {
            self.host.ensure(conv, &internal)?;
        }
        tracing::info!(conversation = conv, "bridge conversation started");
        Ok(BeginChatResult {
            conversation_id: conv.to_string(),
        })
    }

    /// Append the client's message with `finality=turn`. Never blocks
    /// waiting for replies.
    pub fn send_message(
        &self,
        conversation_id: &str,
        message: &str,
        attachments: Vec<AttachmentInput>,
    ) -> Result<SendResult> {
        let conv = parse_conversation_id(conversation_id)?;
        let external = self.template.external_agent();

        let mut refs = Vec::with_capacity(attachments.len());
        for input in attachments {
            let content = decode_content(&input.content_type, &input.content);
            let id = self.orch.put_attachment(NewAttachment {
                name: input.name.clone(),
                content_type: input.content_type.clone(),
                content,
                summary: input.summary.clone(),
                doc_id: None,
            })?;
            refs.push(AttachmentRef {
                id,
                name: input.name,
                content_type: input.content_type,
                summary: input.summary,
            });
        }

        self.orch.send_message(
            conv,
            external,
            MessagePayload {
                text: message.to_owned(),
                attachments: refs,
            },
            Finality::Turn,
            None,
        )?;

        let snap = self.orch.snapshot(conv, false)?;
        let (status, guidance) = derive_guidance(&snap, external);
        Ok(SendResult {
            ok: true,
            guidance,
            status,
        })
    }

    /// Messages appended strictly after the client's most recent message,
    /// long-polling up to `wait_ms` when none have arrived yet.
    pub async fn check_replies(
        &self,
        conversation_id: &str,
        wait_ms: u64,
        max: usize,
    ) -> Result<CheckRepliesResult> {
        let conv = parse_conversation_id(conversation_id)?;
        let external = self.template.external_agent();

        let boundary = self.orch.last_message_seq_by(conv, external)?;
        let mut messages = self.messages_after(conv, boundary)?;

        if messages.is_empty() && wait_ms > 0 {
            let active =
                self.orch.conversations().get(conv)?.status == ConversationStatus::Active;
            if active {
                self.orch
                    .wait_for_event(
                        conv,
                        boundary,
                        |e| e.event_type == EventType::Message,
                        Duration::from_millis(wait_ms),
                    )
                    .await?;
                // Return whatever accumulated by the time we woke up.
                messages = self.messages_after(conv, boundary)?;
            }
        }

        messages.truncate(max);
        let simplified = messages
            .iter()
            .map(|e| self.simplify(e))
            .collect::<Result<Vec<_>>>()?;

        let snap = self.orch.snapshot(conv, false)?;
        let (status, guidance) = derive_guidance(&snap, external);
        Ok(CheckRepliesResult {
            messages: simplified,
            guidance,
            status,
            conversation_ended: snap.status == ConversationStatus::Completed,
        })
    }

    fn messages_after(&self, conv: i64, boundary: u64) -> Result<Vec<Event>> {
        Ok(self
            .orch
            .events_since(conv, boundary)?
            .into_iter()
            .filter(|e| e.event_type == EventType::Message)
            .collect())
    }

    /// Flatten a message event for the MCP client: attachment bytes are
    /// inlined; internal ids and doc ids are not exposed.
    fn simplify(&self, event: &Event) -> Result<SimpleMessage> {
        let payload = event
            .payload
            .as_message()
            .ok_or_else(|| Error::Fatal("simplify called on a non-message event".into()))?;
        let mut attachments = Vec::with_capacity(payload.attachments.len());
        for aref in &payload.attachments {
            let Some(stored) = self.orch.attachment(&aref.id)? else {
                tracing::warn!(attachment = %aref.id, "dangling attachment reference");
                continue;
            };
            attachments.push(SimpleAttachment {
                name: stored.name.clone(),
                content_type: stored.content_type.clone(),
                content: stored.content_as_text(),
                summary: stored.summary.clone(),
            });
        }
        Ok(SimpleMessage {
            from: event.agent_id.clone(),
            at: event.ts,
            text: payload.text.clone(),
            attachments,
        })
    }
}

fn parse_conversation_id(raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| Error::NotFound(format!("conversation '{raw}'")))
}

/// Interpret inbound attachment content: text content types pass through
/// as UTF-8; anything else is tried as base64 first.
fn decode_content(content_type: &str, content: &str) -> Vec<u8> {
    let texty = content_type.starts_with("text/")
        || content_type.contains("json")
        || content_type.contains("xml");
    if texty {
        return content.as_bytes().to_vec();
    }
    BASE64
        .decode(content.as_bytes())
        .unwrap_or_else(|_| content.as_bytes().to_vec())
}
