//! Agent host behavior: lifecycle reconciliation, retries, fallbacks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::config::RetryConfig;
use parley_domain::{
    AgentDescriptor, ConversationMeta, ConversationStatus, Error, EventType, Finality,
    MessagePayload,
};
use parley_gateway::host::{
    AgentHost, AgentStep, ScriptedReasonerFactory, ScriptedSynthesizer, WorkerConfig,
};
use parley_orchestrator::Orchestrator;
use parley_store::{Db, RegistryStore};

struct Harness {
    orch: Arc<Orchestrator>,
    host: Arc<AgentHost>,
    reasoners: Arc<ScriptedReasonerFactory>,
    registry: RegistryStore,
}

fn harness(db_path: &Path) -> Harness {
    let db = Db::open(db_path).unwrap();
    let orch = Arc::new(Orchestrator::new(db.clone(), 256 * 1024));
    let registry = RegistryStore::new(db);
    let reasoners = Arc::new(ScriptedReasonerFactory::new());
    let host = Arc::new(AgentHost::new(
        orch.clone(),
        registry.clone(),
        reasoners.clone(),
        Arc::new(ScriptedSynthesizer::new()),
        WorkerConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
            },
            max_steps_per_turn: 8,
        },
    ));
    Harness {
        orch,
        host,
        reasoners,
        registry,
    }
}

fn meta(agents: &[&str], starting: Option<&str>) -> ConversationMeta {
    ConversationMeta {
        agents: agents.iter().map(|a| AgentDescriptor::new(*a)).collect(),
        starting_agent_id: starting.map(String::from),
        ..Default::default()
    }
}

async fn wait_for_message(
    orch: &Orchestrator,
    conv: i64,
    since: u64,
) -> parley_domain::Event {
    orch.wait_for_event(
        conv,
        since,
        |e| e.event_type == EventType::Message,
        Duration::from_secs(5),
    )
    .await
    .unwrap()
    .expect("expected a message within 5s")
}

#[tokio::test]
async fn restart_resumes_ensured_agents() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("parley.db");

    // First server lifetime: create + ensure, then "shut down".
    let conv = {
        let h = harness(&db_path);
        let conv = h
            .orch
            .create_conversation(meta(&["e", "i"], Some("e")))
            .unwrap();
        h.host.ensure(conv, &["i".into()]).unwrap();
        assert_eq!(h.host.list(conv), vec!["i"]);
        h.host.shutdown();
        conv
    };

    // Second lifetime against the same store: no re-ensure needed.
    let h = harness(&db_path);
    h.reasoners.register("i").push(AgentStep::Message {
        text: "resumed and ready".into(),
        finality: Finality::Turn,
    });
    let resumed = h.host.resume().unwrap();
    assert_eq!(resumed, 1);
    assert_eq!(h.host.list(conv), vec!["i"]);

    // The conversation progresses without another lifecycle.ensure.
    h.orch
        .send_message(conv, "e", MessagePayload::text("are you there?"), Finality::Turn, None)
        .unwrap();
    let reply = wait_for_message(&h.orch, conv, 1).await;
    assert_eq!(reply.agent_id, "i");
    assert_eq!(
        reply.payload.as_message().unwrap().text,
        "resumed and ready"
    );
}

#[tokio::test]
async fn resume_purges_completed_conversations() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("parley.db");

    let conv = {
        let h = harness(&db_path);
        let conv = h
            .orch
            .create_conversation(meta(&["e", "i"], Some("e")))
            .unwrap();
        h.host.ensure(conv, &["i".into()]).unwrap();
        h.host.shutdown();
        // Completed while "the server was down".
        h.orch
            .send_message(conv, "e", MessagePayload::text("bye"), Finality::Conversation, None)
            .unwrap();
        conv
    };

    let h = harness(&db_path);
    assert_eq!(h.host.resume().unwrap(), 0);
    assert!(h.registry.list_for(conv).unwrap().is_empty());
    assert!(h.host.list(conv).is_empty());
}

#[tokio::test]
async fn transient_reasoner_errors_are_retried_within_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir.path().join("parley.db"));
    let conv = h
        .orch
        .create_conversation(meta(&["e", "i"], Some("e")))
        .unwrap();

    let script = h.reasoners.register("i");
    script.push_err(Error::Transient("blip 1".into()));
    script.push_err(Error::Transient("blip 2".into()));
    script.push(AgentStep::Message {
        text: "third time lucky".into(),
        finality: Finality::Turn,
    });
    h.host.ensure(conv, &["i".into()]).unwrap();

    h.orch
        .send_message(conv, "e", MessagePayload::text("hello"), Finality::Turn, None)
        .unwrap();
    let reply = wait_for_message(&h.orch, conv, 1).await;
    assert_eq!(reply.payload.as_message().unwrap().text, "third time lucky");
    // Retries stayed inside the worker: no trace noise in the log.
    let snap = h.orch.snapshot(conv, false).unwrap();
    assert_eq!(snap.events.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_surrender_the_turn_with_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir.path().join("parley.db"));
    let conv = h
        .orch
        .create_conversation(meta(&["e", "i"], Some("e")))
        .unwrap();

    let script = h.reasoners.register("i");
    for i in 0..3 {
        script.push_err(Error::Transient(format!("outage {i}")));
    }
    h.host.ensure(conv, &["i".into()]).unwrap();

    h.orch
        .send_message(conv, "e", MessagePayload::text("hello"), Finality::Turn, None)
        .unwrap();
    let reply = wait_for_message(&h.orch, conv, 1).await;
    assert_eq!(reply.agent_id, "i");
    assert_eq!(reply.finality, Finality::Turn);
    assert!(reply.payload.as_message().unwrap().text.contains("problem"));
    // The conversation remains usable.
    assert_eq!(
        h.orch.snapshot(conv, false).unwrap().status,
        ConversationStatus::Active
    );
}

#[tokio::test]
async fn failed_tool_synthesis_posts_error_result_then_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("parley.db")).unwrap();
    let orch = Arc::new(Orchestrator::new(db.clone(), 256 * 1024));
    let registry = RegistryStore::new(db);
    let reasoners = Arc::new(ScriptedReasonerFactory::new());
    let synth = Arc::new(ScriptedSynthesizer::new());
    let host = Arc::new(AgentHost::new(
        orch.clone(),
        registry,
        reasoners.clone(),
        synth.clone(),
        WorkerConfig {
            retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
            },
            max_steps_per_turn: 8,
        },
    ));

    let conv = orch
        .create_conversation(meta(&["e", "i"], Some("e")))
        .unwrap();
    reasoners.register("i").push(AgentStep::ToolCall {
        name: "broken_tool".into(),
        args: serde_json::json!({}),
    });
    synth.push_err(Error::Transient("backend down".into()));
    synth.push_err(Error::Transient("backend still down".into()));
    host.ensure(conv, &["i".into()]).unwrap();

    orch.send_message(conv, "e", MessagePayload::text("go"), Finality::Turn, None)
        .unwrap();
    let reply = wait_for_message(&orch, conv, 1).await;
    assert_eq!(reply.finality, Finality::Turn);

    let snap = orch.snapshot(conv, false).unwrap();
    let kinds: Vec<_> = snap.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::Message, // e: go
            EventType::Trace,   // tool_call
            EventType::Trace,   // tool_result (error)
            EventType::Message, // fallback, finality=turn
        ]
    );
    let error_trace = snap.events[2].payload.as_trace().unwrap();
    match error_trace {
        parley_domain::TracePayload::ToolResult { error, .. } => {
            assert!(error.as_deref().unwrap().contains("backend"));
        }
        other => panic!("expected tool_result, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_tears_down_workers_and_rows() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir.path().join("parley.db"));
    let conv = h
        .orch
        .create_conversation(meta(&["e", "i"], Some("e")))
        .unwrap();
    h.host.ensure(conv, &["i".into()]).unwrap();
    assert_eq!(h.host.list(conv), vec!["i"]);

    h.host.stop(conv).unwrap();
    assert!(h.host.list(conv).is_empty());
    assert!(h.registry.list_for(conv).unwrap().is_empty());
}

#[tokio::test]
async fn ensure_on_completed_conversation_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir.path().join("parley.db"));
    let conv = h
        .orch
        .create_conversation(meta(&["e", "i"], Some("e")))
        .unwrap();
    h.orch
        .send_message(conv, "e", MessagePayload::text("bye"), Finality::Conversation, None)
        .unwrap();
    assert!(matches!(
        h.host.ensure(conv, &["i".into()]).unwrap_err(),
        Error::ClosedConversation(_)
    ));
}
