//! WebSocket JSON-RPC endpoint — the primary client interface.
//!
//! Framing: one JSON object per text frame. Requests carry an `id` and
//! get exactly one response; subscriptions additionally stream
//! notifications (`method:"event"` / `method:"conversation"`, no id).
//!
//! Flow:
//! 1. Client connects to `GET /api/ws`
//! 2. Reader loop parses frames and dispatches methods
//! 3. A writer task owns the sink; responses and notifications funnel
//!    through one outbound channel so frames never interleave

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use parley_domain::{ConversationMeta, Error, Finality, MessagePayload};

use crate::state::AppState;

const OUTBOUND_QUEUE: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn rpc_result(id: &Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

fn rpc_error(id: &Value, code: i64, message: &str, kind: Option<&str>) -> String {
    let mut error = json!({ "code": code, "message": message });
    if let Some(kind) = kind {
        error["data"] = json!({ "kind": kind });
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error }).to_string()
}

fn notification(method: &str, params: Value) -> String {
    json!({ "jsonrpc": "2.0", "method": method, "params": params }).to_string()
}

fn app_error(id: &Value, e: &Error) -> String {
    rpc_error(id, -32000, &e.to_string(), Some(e.kind()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    // Writer task: sole owner of the sink.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        state,
        outbound: outbound_tx,
        subscriptions: HashMap::new(),
    };

    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(raw)) => {
                if let Some(response) = conn.handle_frame(&raw).await {
                    if conn.outbound.send(Message::Text(response)).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = conn.outbound.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    conn.close();
    writer.abort();
    tracing::debug!("websocket connection closed");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-connection state and dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Connection {
    state: AppState,
    outbound: mpsc::Sender<Message>,
    /// subscriptionId → pump task feeding notifications.
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    async fn handle_frame(&mut self, raw: &str) -> Option<String> {
        let request: RpcRequest = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(e) => {
                return Some(rpc_error(
                    &Value::Null,
                    -32700,
                    &format!("parse error: {e}"),
                    None,
                ));
            }
        };
        let id = request.id.clone().unwrap_or(Value::Null);
        Some(self.dispatch(&id, &request.method, request.params).await)
    }

    async fn dispatch(&mut self, id: &Value, method: &str, params: Value) -> String {
        match method {
            "ping" => rpc_result(id, json!("pong")),
            "createConversation" => self.create_conversation(id, params),
            "getConversation" => self.get_conversation(id, params),
            "sendMessage" => self.send_message(id, params),
            "subscribe" => self.subscribe(id, params).await,
            "unsubscribe" => self.unsubscribe(id, params),
            "subscribeConversations" => self.subscribe_conversations(id).await,
            "lifecycle.ensure" => self.lifecycle_ensure(id, params),
            "lifecycle.stop" => self.lifecycle_stop(id, params),
            other => rpc_error(id, -32601, &format!("unknown method '{other}'"), None),
        }
    }

    fn close(&mut self) {
        for (_, pump) in self.subscriptions.drain() {
            pump.abort();
        }
    }

    // ── Methods ───────────────────────────────────────────────────────

    fn create_conversation(&self, id: &Value, params: Value) -> String {
        #[derive(Deserialize)]
        struct Params {
            meta: ConversationMeta,
        }
        let params: Params = match from_params(params) {
            Ok(p) => p,
            Err(msg) => return rpc_error(id, -32602, &msg, None),
        };
        match self.state.orch.create_conversation(params.meta) {
            Ok(conv) => rpc_result(id, json!({ "conversationId": conv })),
            Err(e) => app_error(id, &e),
        }
    }

    fn get_conversation(&self, id: &Value, params: Value) -> String {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            conversation_id: i64,
            #[serde(default)]
            include_scenario: bool,
        }
        let params: Params = match from_params(params) {
            Ok(p) => p,
            Err(msg) => return rpc_error(id, -32602, &msg, None),
        };
        match self
            .state
            .orch
            .snapshot(params.conversation_id, params.include_scenario)
        {
            Ok(snapshot) => rpc_result(id, serde_json::to_value(snapshot).unwrap_or_default()),
            Err(e) => app_error(id, &e),
        }
    }

    fn send_message(&self, id: &Value, params: Value) -> String {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            conversation_id: i64,
            agent_id: String,
            message_payload: MessagePayload,
            finality: Finality,
            #[serde(default)]
            turn: Option<u64>,
        }
        let params: Params = match from_params(params) {
            Ok(p) => p,
            Err(msg) => return rpc_error(id, -32602, &msg, None),
        };
        match self.state.orch.send_message(
            params.conversation_id,
            &params.agent_id,
            params.message_payload,
            params.finality,
            params.turn,
        ) {
            Ok(out) => rpc_result(id, json!({ "seq": out.seq, "turn": out.turn })),
            Err(e) => app_error(id, &e),
        }
    }

    async fn subscribe(&mut self, id: &Value, params: Value) -> String {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            conversation_id: i64,
            #[serde(default)]
            since_seq: u64,
            #[serde(default)]
            include_guidance: bool,
        }
        let params: Params = match from_params(params) {
            Ok(p) => p,
            Err(msg) => return rpc_error(id, -32602, &msg, None),
        };

        let (backlog, mut sub) = match self.state.orch.subscribe_with_backfill(
            params.conversation_id,
            params.since_seq,
            params.include_guidance,
        ) {
            Ok(pair) => pair,
            Err(e) => return app_error(id, &e),
        };

        let subscription_id = Uuid::new_v4().to_string();
        let outbound = self.outbound.clone();
        let sub_id_for_pump = subscription_id.clone();
        let pump = tokio::spawn(async move {
            for event in backlog {
                let frame = notification("event", serde_json::to_value(&event).unwrap_or_default());
                if outbound.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            while let Some(event) = sub.recv().await {
                let frame = notification("event", serde_json::to_value(&event).unwrap_or_default());
                if outbound.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            // The hub dropped us (overflow): tell the client before going
            // quiet so it can resubscribe with sinceSeq.
            let frame = notification(
                "subscription_closed",
                json!({ "subscriptionId": sub_id_for_pump, "reason": "overflow" }),
            );
            let _ = outbound.send(Message::Text(frame)).await;
        });

        self.subscriptions.insert(subscription_id.clone(), pump);
        rpc_result(id, json!({ "subscriptionId": subscription_id }))
    }

    fn unsubscribe(&mut self, id: &Value, params: Value) -> String {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            subscription_id: String,
        }
        let params: Params = match from_params(params) {
            Ok(p) => p,
            Err(msg) => return rpc_error(id, -32602, &msg, None),
        };
        match self.subscriptions.remove(&params.subscription_id) {
            Some(pump) => {
                // Aborting the pump drops its Subscription, which
                // unregisters from the hub.
                pump.abort();
                rpc_result(id, json!({ "ok": true }))
            }
            None => rpc_error(
                id,
                -32602,
                &format!("unknown subscription '{}'", params.subscription_id),
                None,
            ),
        }
    }

    async fn subscribe_conversations(&mut self, id: &Value) -> String {
        let mut firehose = self.state.orch.subscribe_conversations();
        let subscription_id = Uuid::new_v4().to_string();
        let outbound = self.outbound.clone();
        let pump = tokio::spawn(async move {
            while let Some(conv) = firehose.recv().await {
                let frame = notification("conversation", json!({ "conversationId": conv }));
                if outbound.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
        });
        self.subscriptions.insert(subscription_id.clone(), pump);
        rpc_result(id, json!({ "subscriptionId": subscription_id }))
    }

    fn lifecycle_ensure(&self, id: &Value, params: Value) -> String {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            conversation_id: i64,
            agent_ids: Vec<String>,
        }
        let params: Params = match from_params(params) {
            Ok(p) => p,
            Err(msg) => return rpc_error(id, -32602, &msg, None),
        };
        match self
            .state
            .host
            .ensure(params.conversation_id, &params.agent_ids)
        {
            Ok(ensured) => {
                let entries: Vec<Value> = ensured.iter().map(|a| json!({ "id": a })).collect();
                rpc_result(id, json!({ "ensured": entries }))
            }
            Err(e) => app_error(id, &e),
        }
    }

    fn lifecycle_stop(&self, id: &Value, params: Value) -> String {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Params {
            conversation_id: i64,
        }
        let params: Params = match from_params(params) {
            Ok(p) => p,
            Err(msg) => return rpc_error(id, -32602, &msg, None),
        };
        match self.state.host.stop(params.conversation_id) {
            Ok(_) => rpc_result(id, json!({ "ok": true })),
            Err(e) => app_error(id, &e),
        }
    }
}

fn from_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_frames_are_well_formed() {
        let result = rpc_result(&json!(1), json!("pong"));
        let v: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 1);
        assert_eq!(v["result"], "pong");

        let error = rpc_error(&json!(2), -32601, "unknown method", Some("not_found"));
        let v: Value = serde_json::from_str(&error).unwrap();
        assert_eq!(v["error"]["code"], -32601);
        assert_eq!(v["error"]["data"]["kind"], "not_found");

        let note = notification("event", json!({"seq": 1}));
        let v: Value = serde_json::from_str(&note).unwrap();
        assert!(v.get("id").is_none());
        assert_eq!(v["method"], "event");
    }

    #[test]
    fn request_parses_with_and_without_id() {
        let with_id: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        assert_eq!(with_id.id, Some(json!(7)));
        assert_eq!(with_id.method, "ping");

        let notification: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(notification.id.is_none());
    }
}
