//! WebSocket JSON-RPC end to end: a real client against a live server.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use parley_domain::config::Config;
use parley_gateway::{api, bootstrap};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server() -> SocketAddr {
    let mut config = Config::default();
    config.storage.db_path = ":memory:".into();
    let state = bootstrap::build_state(Arc::new(config)).unwrap();
    let app = api::router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Small JSON-RPC client: responses are matched by id, notifications are
/// buffered in arrival order.
struct Client {
    ws: WsClient,
    notifications: VecDeque<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/api/ws")).await.unwrap();
        Self {
            ws,
            notifications: VecDeque::new(),
        }
    }

    async fn recv_frame(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            if let WsMessage::Text(raw) = frame {
                return serde_json::from_str(&raw).unwrap();
            }
        }
    }

    async fn request(&mut self, id: u64, method: &str, params: Value) -> Value {
        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.ws
            .send(WsMessage::Text(frame.to_string()))
            .await
            .unwrap();
        loop {
            let value = self.recv_frame().await;
            if value.get("id") == Some(&json!(id)) {
                return value;
            }
            self.notifications.push_back(value);
        }
    }

    async fn next_notification(&mut self, method: &str) -> Value {
        if let Some(pos) = self
            .notifications
            .iter()
            .position(|n| n["method"] == method)
        {
            return self.notifications.remove(pos).unwrap();
        }
        loop {
            let value = self.recv_frame().await;
            if value["method"] == method {
                return value;
            }
            self.notifications.push_back(value);
        }
    }
}

#[tokio::test]
async fn json_rpc_method_table_round_trip() {
    let addr = spawn_server().await;
    let mut client = Client::connect(addr).await;

    // ping
    let pong = client.request(1, "ping", Value::Null).await;
    assert_eq!(pong["result"], "pong");

    // createConversation
    let created = client
        .request(
            2,
            "createConversation",
            json!({ "meta": { "title": "ws test", "agents": [{"id": "a"}, {"id": "b"}] } }),
        )
        .await;
    let conv = created["result"]["conversationId"].as_i64().unwrap();

    // subscribe before any event exists
    let subscribed = client
        .request(3, "subscribe", json!({ "conversationId": conv }))
        .await;
    let sub_id = subscribed["result"]["subscriptionId"].as_str().unwrap().to_owned();

    // sendMessage closes turn 1
    let sent = client
        .request(
            4,
            "sendMessage",
            json!({
                "conversationId": conv,
                "agentId": "a",
                "messagePayload": { "text": "hi" },
                "finality": "turn"
            }),
        )
        .await;
    assert_eq!(sent["result"]["seq"], 1);
    assert_eq!(sent["result"]["turn"], 1);

    // The subscription streams the event.
    let event = client.next_notification("event").await;
    assert_eq!(event["params"]["seq"], 1);
    assert_eq!(event["params"]["agentId"], "a");
    assert_eq!(event["params"]["payload"]["text"], "hi");

    // getConversation snapshot
    let snapshot = client
        .request(5, "getConversation", json!({ "conversationId": conv }))
        .await;
    assert_eq!(snapshot["result"]["lastClosedSeq"], 1);
    assert_eq!(snapshot["result"]["status"], "active");
    assert_eq!(snapshot["result"]["events"].as_array().unwrap().len(), 1);

    // lifecycle.ensure spawns a hosted worker for "b". With no provider
    // configured it surrenders its turn with a fallback message, which
    // still proves the worker loop end to end.
    let ensured = client
        .request(
            6,
            "lifecycle.ensure",
            json!({ "conversationId": conv, "agentIds": ["b"] }),
        )
        .await;
    assert_eq!(ensured["result"]["ensured"], json!([{"id": "b"}]));

    let fallback = client.next_notification("event").await;
    assert_eq!(fallback["params"]["agentId"], "b");
    assert_eq!(fallback["params"]["finality"], "turn");

    // lifecycle.stop and unsubscribe
    let stopped = client
        .request(7, "lifecycle.stop", json!({ "conversationId": conv }))
        .await;
    assert_eq!(stopped["result"]["ok"], true);

    let unsubscribed = client
        .request(8, "unsubscribe", json!({ "subscriptionId": sub_id }))
        .await;
    assert_eq!(unsubscribed["result"]["ok"], true);
}

#[tokio::test]
async fn errors_come_back_as_json_rpc_errors() {
    let addr = spawn_server().await;
    let mut client = Client::connect(addr).await;

    // Unknown method.
    let unknown = client.request(1, "definitely.not.a.method", Value::Null).await;
    assert_eq!(unknown["error"]["code"], -32601);

    // Unknown conversation.
    let missing = client
        .request(2, "getConversation", json!({ "conversationId": 999 }))
        .await;
    assert_eq!(missing["error"]["code"], -32000);
    assert_eq!(missing["error"]["data"]["kind"], "not_found");

    // Agent outside the conversation.
    let conv = client
        .request(
            3,
            "createConversation",
            json!({ "meta": { "agents": [{"id": "a"}] } }),
        )
        .await["result"]["conversationId"]
        .as_i64()
        .unwrap();
    let forbidden = client
        .request(
            4,
            "sendMessage",
            json!({
                "conversationId": conv,
                "agentId": "stranger",
                "messagePayload": { "text": "hi" },
                "finality": "none"
            }),
        )
        .await;
    assert_eq!(forbidden["error"]["data"]["kind"], "agent_not_permitted");
}

#[tokio::test]
async fn conversation_firehose_announces_new_conversations() {
    let addr = spawn_server().await;
    let mut watcher = Client::connect(addr).await;
    let mut creator = Client::connect(addr).await;

    watcher
        .request(1, "subscribeConversations", Value::Null)
        .await;
    let conv = creator
        .request(
            1,
            "createConversation",
            json!({ "meta": { "agents": [{"id": "a"}] } }),
        )
        .await["result"]["conversationId"]
        .as_i64()
        .unwrap();

    let announced = watcher.next_notification("conversation").await;
    assert_eq!(announced["params"]["conversationId"], conv);
}
