//! Agent session layer.
//!
//! Speaks an OpAMP-shaped protocol over WebSocket at `GET /v1/opamp`. The
//! session layer preserves per-agent state across reconnects: the registry
//! holds the durable record, the session table holds the live send handle,
//! and every inbound message is reconciled against the resolver.

pub mod proto;
pub mod server;

pub use server::OpampServer;
