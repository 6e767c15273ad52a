//! Shared domain types for all parley crates.
//!
//! Everything that crosses a crate boundary lives here: the event model,
//! conversation metadata, scenarios, attachments, configuration, and the
//! error taxonomy.

pub mod attachment;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event;
pub mod scenario;

pub use attachment::{Attachment, AttachmentRef};
pub use conversation::{
    AgentDescriptor, ConversationMeta, ConversationRow, ConversationStatus, Head, Snapshot,
};
pub use error::{Error, Result};
pub use event::{
    AppendOutcome, Event, EventType, Finality, GuidancePayload, MessagePayload, EventPayload,
    SystemPayload, TracePayload,
};
pub use scenario::{Scenario, ScenarioAgent, ScenarioTool};
