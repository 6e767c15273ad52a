//! The rmcp [`ServerHandler`] wrapping [`Bridge`].
//!
//! Exposes three tools: `begin_chat_thread`, `send_message_to_chat_thread`
//! and `check_replies`. Orchestrator errors are mapped before they reach
//! the client: retry-safe conditions come back as a normal result with
//! `status:"working"` and an explanatory guidance line; everything else is
//! an MCP protocol error.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::{
    handler::server::ServerHandler,
    model::{
        CallToolRequestParams, CallToolResult, Content, JsonObject, ListToolsResult,
        PaginatedRequestParams, ServerCapabilities, ServerInfo, Tool as McpTool,
    },
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};
use serde::Deserialize;
use serde_json::{json, Value};

use parley_domain::Error;

use crate::mcp::bridge::{AttachmentInput, Bridge};

#[derive(Clone)]
pub struct BridgeServer {
    bridge: Arc<Bridge>,
}

impl BridgeServer {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool argument shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendArgs {
    conversation_id: String,
    message: String,
    #[serde(default)]
    attachments: Vec<AttachmentInput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckArgs {
    conversation_id: String,
    #[serde(default = "default_wait_ms")]
    wait_ms: u64,
    #[serde(default = "default_max")]
    max: usize,
}

fn default_wait_ms() -> u64 {
    10_000
}

fn default_max() -> usize {
    200
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn tool(name: &str, description: &str, schema: Value) -> McpTool {
    let input_schema: JsonObject = match schema {
        Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    McpTool::new(
        Cow::Owned(name.to_owned()),
        Cow::Owned(description.to_owned()),
        Arc::new(input_schema),
    )
}

fn tool_descriptors() -> Vec<McpTool> {
    vec![
        tool(
            "begin_chat_thread",
            "Start a new conversation from this bridge's template. Returns the conversation id.",
            json!({ "type": "object", "properties": {}, "required": [] }),
        ),
        tool(
            "send_message_to_chat_thread",
            "Send a message as your agent, ending your turn. Does not wait for replies.",
            json!({
                "type": "object",
                "properties": {
                    "conversationId": { "type": "string" },
                    "message": { "type": "string" },
                    "attachments": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "contentType": { "type": "string" },
                                "content": { "type": "string" },
                                "summary": { "type": "string" }
                            },
                            "required": ["name", "contentType", "content"]
                        }
                    }
                },
                "required": ["conversationId", "message"]
            }),
        ),
        tool(
            "check_replies",
            "Fetch messages sent after your last message, waiting up to waitMs for one to arrive.",
            json!({
                "type": "object",
                "properties": {
                    "conversationId": { "type": "string" },
                    "waitMs": { "type": "integer", "default": 10000 },
                    "max": { "type": "integer", "default": 200 }
                },
                "required": ["conversationId"]
            }),
        ),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error mapping and result packing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn json_result(value: Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(value.to_string())])
}

/// Map an orchestrator error for the external client.
///
/// Turn races and transient conditions are safe to retry: the client gets
/// a normal `working` response with guidance. Closed conversations come
/// back as `completed`. True caller mistakes become protocol errors.
fn map_bridge_error(e: Error) -> std::result::Result<CallToolResult, McpError> {
    match e {
        Error::WrongAgent { .. } | Error::TurnMismatch(_) | Error::NoOpenTurn => {
            Ok(json_result(json!({
                "ok": false,
                "status": "working",
                "guidance": "It is not your turn right now — check replies and try again.",
            })))
        }
        Error::Transient(msg) => Ok(json_result(json!({
            "ok": false,
            "status": "working",
            "guidance": format!("Temporary problem ({msg}); try again shortly."),
        }))),
        Error::ClosedConversation(_) => Ok(json_result(json!({
            "ok": false,
            "status": "completed",
            "guidance": "Conversation ended.",
        }))),
        Error::NotFound(what) => Err(McpError::invalid_params(
            format!("not found: {what}"),
            None,
        )),
        Error::AgentNotPermitted(agent) => Err(McpError::invalid_params(
            format!("agent '{agent}' is not part of this conversation"),
            None,
        )),
        Error::PayloadTooLarge { size, max } => Err(McpError::invalid_params(
            format!("payload too large: {size} bytes (max {max})"),
            None,
        )),
        other => Err(McpError::internal_error(other.to_string(), None)),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    arguments: Option<JsonObject>,
) -> std::result::Result<T, McpError> {
    let value = Value::Object(arguments.unwrap_or_default());
    serde_json::from_value(value)
        .map_err(|e| McpError::invalid_params(format!("bad arguments: {e}"), None))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ServerHandler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl ServerHandler for BridgeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "Talk to the agents hosted by this parley server. Call begin_chat_thread \
                 once, then alternate send_message_to_chat_thread and check_replies."
                    .to_owned(),
            ),
            ..ServerInfo::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: tool_descriptors(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "begin_chat_thread" => match self.bridge.begin_chat_thread() {
                Ok(result) => Ok(json_result(serde_json::to_value(result).unwrap_or_default())),
                Err(e) => map_bridge_error(e),
            },
            "send_message_to_chat_thread" => {
                let args: SendArgs = parse_args(request.arguments)?;
                match self
                    .bridge
                    .send_message(&args.conversation_id, &args.message, args.attachments)
                {
                    Ok(result) => {
                        Ok(json_result(serde_json::to_value(result).unwrap_or_default()))
                    }
                    Err(e) => map_bridge_error(e),
                }
            }
            "check_replies" => {
                let args: CheckArgs = parse_args(request.arguments)?;
                match self
                    .bridge
                    .check_replies(&args.conversation_id, args.wait_ms, args.max)
                    .await
                {
                    Ok(result) => {
                        Ok(json_result(serde_json::to_value(result).unwrap_or_default()))
                    }
                    Err(e) => map_bridge_error(e),
                }
            }
            other => Err(McpError::invalid_params(
                format!("unknown tool '{other}'"),
                None,
            )),
        }
    }
}

/// Serve the bridge on stdin/stdout. Blocks until the client disconnects.
pub async fn serve_stdio(bridge: Arc<Bridge>) -> anyhow::Result<()> {
    use rmcp::ServiceExt;
    let server = BridgeServer::new(bridge);
    let running = server
        .serve((tokio::io::stdin(), tokio::io::stdout()))
        .await
        .map_err(|e| anyhow::anyhow!("MCP server init error: {e}"))?;
    running
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;
    Ok(())
}
