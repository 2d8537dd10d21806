//! # fleetd-core
//!
//! Core library for fleetd, a control plane for fleets of long-lived
//! telemetry collector agents.
//!
//! This crate provides the building blocks the daemon wires together:
//!
//! - **Registry**: durable per-agent state (SQLite) with an event
//!   subscription surface
//! - **Config Store**: atomic in-memory snapshot of the configuration
//!   repository contents
//! - **Resolver**: label-selector matching plus deterministic deep-merge
//!   into one effective document with a stable fingerprint
//! - **Git Sync**: periodic and on-demand pull of the configuration
//!   repository with commit-transition callbacks
//!
//! The agent session layer and the admin HTTP surface live in the
//! `fleetd-daemon` crate; this crate is transport-agnostic.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gitsync;
pub mod model;
pub mod registry;
pub mod resolve;
pub mod store;

pub use gitsync::{GitAuth, GitSyncConfig, GitSyncError, GitSyncer};
pub use model::{
    Agent, AgentDescription, AgentFilter, AgentStatus, ApplyStatus, ConfigSelector,
    EffectiveConfig, SelectorMatch, fingerprint,
};
pub use registry::sqlite::SqliteRegistry;
pub use registry::{Registry, RegistryError, RegistryEvent, RegistryEventKind};
pub use resolve::{ResolveError, Resolver};
pub use store::{ConfigStore, DocumentSet, LoadError};
