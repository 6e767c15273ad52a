//! The agent host — in-process workers for scenario-driven agents.
//!
//! Intent vs. actuation: the persistent half lives in the
//! [`RegistryStore`] (which conversations/agents this server should
//! host); the in-memory half is the worker tasks managed here. `ensure`
//! and `stop` update both; `resume` reconciles actuation to intent at
//! boot.

pub mod cancel;
pub mod reasoner;
pub mod synthesis;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use parley_domain::{ConversationStatus, Error, Result, ScenarioAgent};
use parley_orchestrator::Orchestrator;
use parley_store::RegistryStore;

pub use cancel::CancelToken;
pub use reasoner::{
    AgentReasoner, AgentStep, LlmReasonerFactory, ReasonerFactory, ScriptedReasoner,
    ScriptedReasonerFactory, TurnContext,
};
pub use synthesis::{
    LlmSynthesizer, NoProviderSynthesizer, ScriptedSynthesizer, SynthesisRequest, ToolSynthesizer,
};
pub use worker::{Worker, WorkerConfig};

struct WorkerHandle {
    cancel: CancelToken,
    join: JoinHandle<()>,
}

pub struct AgentHost {
    orch: Arc<Orchestrator>,
    registry: RegistryStore,
    reasoners: Arc<dyn ReasonerFactory>,
    synthesizer: Arc<dyn ToolSynthesizer>,
    config: WorkerConfig,
    workers: Mutex<HashMap<(i64, String), WorkerHandle>>,
}

impl AgentHost {
    pub fn new(
        orch: Arc<Orchestrator>,
        registry: RegistryStore,
        reasoners: Arc<dyn ReasonerFactory>,
        synthesizer: Arc<dyn ToolSynthesizer>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            orch,
            registry,
            reasoners,
            synthesizer,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    /// Record intent and start workers for `agent_ids`. Idempotent.
    pub fn ensure(&self, conv: i64, agent_ids: &[String]) -> Result<Vec<String>> {
        let row = self.orch.conversations().get(conv)?;
        if row.status == ConversationStatus::Completed {
            return Err(Error::ClosedConversation(conv));
        }
        self.registry.ensure(conv, agent_ids)?;
        for agent_id in agent_ids {
            self.spawn_worker(conv, agent_id)?;
        }
        Ok(agent_ids.to_vec())
    }

    /// Delete intent rows and tear down workers for a conversation.
    pub fn stop(&self, conv: i64) -> Result<usize> {
        let removed = self.registry.stop(conv)?;
        let mut workers = self.workers.lock();
        workers.retain(|(c, _), handle| {
            if *c == conv {
                handle.cancel.cancel();
                handle.join.abort();
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    /// Agent ids with a live worker in `conv`.
    pub fn list(&self, conv: i64) -> Vec<String> {
        let workers = self.workers.lock();
        let mut ids: Vec<String> = workers
            .iter()
            .filter(|((c, _), handle)| *c == conv && !handle.join.is_finished())
            .map(|((_, agent), _)| agent.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Boot reconciliation: re-materialize workers for every registry row
    /// whose conversation is still active; purge rows whose conversation
    /// completed (or vanished) while the server was down.
    pub fn resume(&self) -> Result<usize> {
        let mut started = 0;
        let mut purged: Vec<i64> = Vec::new();
        for row in self.registry.list()? {
            if purged.contains(&row.conversation_id) {
                continue;
            }
            match self.orch.conversations().status(row.conversation_id) {
                Ok(ConversationStatus::Active) => {
                    match self.spawn_worker(row.conversation_id, &row.agent_id) {
                        Ok(()) => started += 1,
                        Err(e) => tracing::error!(
                            conversation = row.conversation_id,
                            agent = %row.agent_id,
                            error = %e,
                            "failed to resume worker"
                        ),
                    }
                }
                Ok(ConversationStatus::Completed) | Err(Error::NotFound(_)) => {
                    self.registry.stop(row.conversation_id)?;
                    purged.push(row.conversation_id);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(started, purged = purged.len(), "agent host resumed");
        Ok(started)
    }

    /// Cancel every worker (server shutdown).
    pub fn shutdown(&self) {
        let workers = self.workers.lock();
        for handle in workers.values() {
            handle.cancel.cancel();
        }
    }

    fn spawn_worker(&self, conv: i64, agent_id: &str) -> Result<()> {
        let key = (conv, agent_id.to_owned());
        {
            let workers = self.workers.lock();
            if let Some(handle) = workers.get(&key) {
                if !handle.join.is_finished() {
                    return Ok(());
                }
            }
        }

        let row = self.orch.conversations().get(conv)?;
        let scenario_agent: Option<ScenarioAgent> = match &row.metadata.scenario_id {
            Some(scenario_id) => match self.orch.scenarios().get_active(scenario_id)? {
                Some(scenario) => scenario.agent(agent_id).cloned(),
                // Missing scenario is a hard error: no worker, row stays.
                None => {
                    return Err(Error::NotFound(format!(
                        "scenario '{scenario_id}' for conversation {conv}"
                    )))
                }
            },
            None => None,
        };

        let reasoner = self
            .reasoners
            .build(agent_id, &row.metadata, scenario_agent.as_ref());
        let cancel = CancelToken::new();
        let worker = Worker {
            conv,
            agent_id: agent_id.to_owned(),
            orch: self.orch.clone(),
            registry: self.registry.clone(),
            meta: row.metadata,
            scenario_agent,
            reasoner,
            synthesizer: self.synthesizer.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(worker.run());
        self.workers.lock().insert(key, WorkerHandle { cancel, join });
        tracing::info!(conversation = conv, agent = agent_id, "worker started");
        Ok(())
    }
}
