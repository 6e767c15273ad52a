//! The parley gateway — server surfaces over the orchestrator core.
//!
//! - `api/` — HTTP REST, WebSocket JSON-RPC, and SSE endpoints
//! - `host/` — in-process workers for scenario-driven agents
//! - `mcp/` — the external MCP bridge (begin/send/check tools)
//! - `bootstrap` — wiring: storage, orchestrator, host, watchdog, router

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod host;
pub mod mcp;
pub mod state;
