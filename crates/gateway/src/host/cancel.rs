//! Cooperative cancellation for agent workers.
//!
//! Each worker holds a `CancelToken`; the host signals it when the
//! conversation is stopped. Workers check the token between reasoner
//! steps (in-flight LLM work is abandoned, never interrupted mid-append)
//! and await it while idle so a stop wakes them immediately.

use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}
