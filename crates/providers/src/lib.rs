//! LLM provider adapters.
//!
//! The orchestrator core treats text generation as an external
//! collaborator: everything behind [`LlmProvider`] is replaceable. The
//! built-in adapter speaks the OpenAI-compatible chat completions wire
//! format; [`ScriptedProvider`] drives deterministic tests.

pub mod openai_compat;
pub mod retry;
pub mod scripted;
pub mod traits;

pub use openai_compat::OpenAiCompatProvider;
pub use retry::with_backoff;
pub use scripted::ScriptedProvider;
pub use traits::{ChatMessage, GenerateRequest, GenerateResponse, LlmProvider, Role};
