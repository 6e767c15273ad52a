//! OpenAI-compatible chat completions adapter.
//!
//! Works against any endpoint that accepts
//! `POST {base_url}/chat/completions` with the standard request body
//! (OpenAI, vLLM, Ollama's compat layer, LiteLLM, ...).

use serde::Deserialize;
use serde_json::json;

use parley_domain::config::LlmConfig;
use parley_domain::{Error, Result};

use crate::traits::{GenerateRequest, GenerateResponse, LlmProvider};

#[derive(Debug)]
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    default_temperature: f32,
}

impl OpenAiCompatProvider {
    /// Build from config. The API key is read from the configured
    /// environment variable; absence is allowed (local endpoints).
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::Config("llm.base_url is empty".into()));
        }
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "no LLM API key in environment — requests go out unauthenticated"
            );
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key,
            default_model: config.default_model.clone(),
            default_temperature: config.temperature,
        })
    }
}

#[derive(Deserialize)]
struct CompletionsResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse> {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let body = json!({
            "model": model,
            "messages": req.messages,
            "temperature": req.temperature.unwrap_or(self.default_temperature),
            "max_tokens": req.max_tokens,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // 429 and 5xx are worth retrying; 4xx are caller bugs.
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(Error::Transient(format!("provider {status}: {text}")));
            }
            return Err(Error::Http(format!("provider {status}: {text}")));
        }

        let parsed: CompletionsResponse = response.json().await.map_err(from_reqwest)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Http("provider returned no choices".into()))?;
        Ok(GenerateResponse {
            content: choice.message.content,
            model: if parsed.model.is_empty() {
                model
            } else {
                parsed.model
            },
        })
    }

    fn provider_id(&self) -> &str {
        "openai-compat"
    }
}

/// Network-layer failures are all retryable.
fn from_reqwest(e: reqwest::Error) -> Error {
    Error::Transient(e.to_string())
}
