use std::sync::Arc;

use parley_domain::config::Config;
use parley_orchestrator::Orchestrator;
use parley_providers::LlmProvider;

use crate::host::AgentHost;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orch: Arc<Orchestrator>,
    pub host: Arc<AgentHost>,
    /// Built-in provider; `None` when `llm.base_url` is unset.
    pub llm: Option<Arc<dyn LlmProvider>>,
}
