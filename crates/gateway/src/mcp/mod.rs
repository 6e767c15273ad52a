//! The MCP bridge — lets an external MCP client act as one nominated
//! agent in bridge-spawned conversations.
//!
//! A configuration token (base64url JSON, see [`template`]) fixes the
//! conversation template. `parley mcp --token <...>` serves the three
//! bridge tools over stdio.

pub mod bridge;
pub mod guidance;
pub mod server;
pub mod template;

pub use bridge::{Bridge, BeginChatResult, CheckRepliesResult, SendResult};
pub use guidance::{derive_guidance, BridgeStatus};
pub use server::{serve_stdio, BridgeServer};
pub use template::{config_hash, BridgeTemplate};
