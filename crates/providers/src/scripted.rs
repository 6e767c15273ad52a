//! Deterministic provider for tests: hands back queued responses in order.

use std::collections::VecDeque;

use parking_lot::Mutex;

use parley_domain::{Error, Result};

use crate::traits::{GenerateRequest, GenerateResponse, LlmProvider};

#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<String>>>,
    calls: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn push(&self, content: impl Into<String>) -> &Self {
        self.responses.lock().push_back(Ok(content.into()));
        self
    }

    /// Queue a failure.
    pub fn push_err(&self, err: Error) -> &Self {
        self.responses.lock().push_back(Err(err));
        self
    }

    /// Requests seen so far (assertions on prompts).
    pub fn calls(&self) -> Vec<GenerateRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse> {
        self.calls.lock().push(req.clone());
        match self.responses.lock().pop_front() {
            Some(Ok(content)) => Ok(GenerateResponse {
                content,
                model: "scripted".into(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(Error::Fatal("scripted provider ran out of responses".into())),
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_runs_dry() {
        let p = ScriptedProvider::new();
        p.push("first").push("second");
        let req = GenerateRequest::default();
        assert_eq!(p.generate(&req).await.unwrap().content, "first");
        assert_eq!(p.generate(&req).await.unwrap().content, "second");
        assert!(p.generate(&req).await.is_err());
        assert_eq!(p.calls().len(), 3);
    }

    #[tokio::test]
    async fn queued_errors_surface() {
        let p = ScriptedProvider::new();
        p.push_err(Error::Transient("blip".into()));
        assert!(p.generate(&GenerateRequest::default()).await.unwrap_err().is_transient());
    }
}
