//! # fleetd-daemon
//!
//! The fleetd server: accepts OpAMP agent sessions over WebSocket, serves
//! the admin HTTP API, and wires Git synchronization into configuration
//! fan-out. The reusable building blocks (registry, resolver, syncer) live
//! in `fleetd-core`; this crate owns the transports and the process
//! lifecycle.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod http;
pub mod opamp;
