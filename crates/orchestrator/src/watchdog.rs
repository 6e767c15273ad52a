//! Background sweeper for stalled conversations.
//!
//! Every sweep finds active conversations whose last event is older than
//! the stall threshold (and that are past the minimum age, so fresh
//! conversations are never raced), cancels them, and clears their
//! lifecycle rows. An `on_stop` hook lets the server tear down hosted
//! workers in the same pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use parley_domain::config::WatchdogConfig;
use parley_store::RegistryStore;

use crate::orchestrator::Orchestrator;

type StopHook = Box<dyn Fn(i64) + Send + Sync>;

pub struct Watchdog {
    orch: Arc<Orchestrator>,
    registry: RegistryStore,
    config: WatchdogConfig,
    on_stop: Option<StopHook>,
}

impl Watchdog {
    pub fn new(orch: Arc<Orchestrator>, registry: RegistryStore, config: WatchdogConfig) -> Self {
        Self {
            orch,
            registry,
            config,
            on_stop: None,
        }
    }

    /// Hook invoked (with the conversation id) after each cancellation.
    pub fn on_stop(mut self, hook: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// One sweep: cancel every stalled conversation. Returns how many
    /// were cancelled.
    pub fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let stalled_before = now - chrono::Duration::seconds(self.config.stall_after_secs as i64);
        let created_before = now - chrono::Duration::seconds(self.config.min_age_secs as i64);

        let stalled = match self.orch.conversations().stalled(stalled_before, created_before) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "watchdog staleness query failed");
                return 0;
            }
        };

        let mut cancelled = 0;
        for conv in stalled {
            match self.orch.cancel_conversation(conv, "stalled: no activity") {
                Ok(_) => {
                    cancelled += 1;
                    if let Err(e) = self.registry.stop(conv) {
                        tracing::warn!(conversation = conv, error = %e, "registry stop failed");
                    }
                    if let Some(hook) = &self.on_stop {
                        hook(conv);
                    }
                    tracing::info!(conversation = conv, "watchdog cancelled stalled conversation");
                }
                Err(e) => {
                    // Lost a race with a concurrent close — nothing to do.
                    tracing::debug!(conversation = conv, error = %e, "watchdog cancel skipped");
                }
            }
        }
        cancelled
    }

    /// Start the periodic sweep loop.
    pub fn spawn(self) -> WatchdogHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = self.sweep_once();
                        if swept > 0 {
                            tracing::info!(swept, "watchdog sweep finished");
                        }
                    }
                }
            }
            tracing::debug!("watchdog stopped");
        });
        WatchdogHandle { token, join }
    }
}

/// Handle to a running watchdog. Shutdown is cooperative.
pub struct WatchdogHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl WatchdogHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}
