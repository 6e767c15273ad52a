//! Wiring: storage → orchestrator → host → watchdog → HTTP server.

use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_domain::config::{Config, ConfigSeverity};
use parley_orchestrator::{Orchestrator, Watchdog, WatchdogHandle};
use parley_providers::{LlmProvider, OpenAiCompatProvider};
use parley_store::{Db, RegistryStore};

use crate::api;
use crate::host::{
    AgentHost, LlmReasonerFactory, LlmSynthesizer, NoProviderSynthesizer, ToolSynthesizer,
    WorkerConfig,
};
use crate::mcp::{serve_stdio, Bridge};
use crate::state::AppState;

/// Build the full application state against the configured database.
pub fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let db = if config.storage.db_path.as_os_str() == ":memory:" {
        Db::open_in_memory()
    } else {
        Db::open(&config.storage.db_path)
    }
    .with_context(|| format!("opening database at {}", config.storage.db_path.display()))?;

    let orch = Arc::new(Orchestrator::new(
        db.clone(),
        config.storage.max_payload_bytes,
    ));
    let registry = RegistryStore::new(db);

    let llm: Option<Arc<dyn LlmProvider>> = if config.llm.base_url.is_empty() {
        tracing::warn!("no llm.base_url configured — hosted agents cannot generate text");
        None
    } else {
        Some(Arc::new(
            OpenAiCompatProvider::from_config(&config.llm).context("building LLM provider")?,
        ))
    };

    let synthesizer: Arc<dyn ToolSynthesizer> = match &llm {
        Some(provider) => Arc::new(LlmSynthesizer::new(provider.clone())),
        None => Arc::new(NoProviderSynthesizer),
    };
    let host = Arc::new(AgentHost::new(
        orch.clone(),
        registry,
        Arc::new(LlmReasonerFactory::new(llm.clone())),
        synthesizer,
        WorkerConfig {
            retry: config.llm.retry,
            max_steps_per_turn: config.host.max_steps_per_turn,
        },
    ));

    Ok(AppState {
        config,
        orch,
        host,
        llm,
    })
}

/// Fail startup on config errors, log warnings.
pub fn check_config(config: &Config) -> anyhow::Result<()> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }
    Ok(())
}

/// Reconcile hosted workers to registry intent and start the watchdog.
pub fn start_background(state: &AppState) -> anyhow::Result<Option<WatchdogHandle>> {
    let resumed = state.host.resume().context("resuming hosted agents")?;
    if resumed > 0 {
        tracing::info!(resumed, "re-materialized hosted agents");
    }

    if !state.config.watchdog.enabled {
        return Ok(None);
    }
    let host = state.host.clone();
    let watchdog = Watchdog::new(
        state.orch.clone(),
        state.host.registry().clone(),
        state.config.watchdog.clone(),
    )
    .on_stop(move |conv| {
        if let Err(e) = host.stop(conv) {
            tracing::warn!(conversation = conv, error = %e, "worker teardown failed");
        }
    });
    Ok(Some(watchdog.spawn()))
}

/// Start the gateway server with the given configuration.
pub async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("parley starting");
    check_config(&config)?;

    let state = build_state(config.clone())?;
    let watchdog = start_background(&state)?;

    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(handle) = watchdog {
        handle.join().await;
    }
    state.host.shutdown();
    tracing::info!("parley stopped");
    Ok(())
}

/// Serve the MCP bridge on stdio against the same storage and hosting
/// stack the HTTP server uses.
pub async fn run_mcp(config: Arc<Config>, token: &str) -> anyhow::Result<()> {
    check_config(&config)?;
    let state = build_state(config)?;
    let watchdog = start_background(&state)?;

    let bridge = Arc::new(
        Bridge::new(state.orch.clone(), state.host.clone(), token)
            .context("invalid bridge token")?,
    );
    tracing::info!(
        external = bridge.template().external_agent(),
        "MCP bridge serving on stdio"
    );
    serve_stdio(bridge).await?;

    if let Some(handle) = watchdog {
        handle.join().await;
    }
    state.host.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }
}
