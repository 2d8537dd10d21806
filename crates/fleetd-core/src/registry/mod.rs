//! Agent registry: durable per-agent state with an event surface.
//!
//! The registry is the single durable store of the control plane. It owns
//! agent identity, connection status, and the desired/applied configuration
//! bookkeeping the push path depends on.
//!
//! # Ownership of the desired hash
//!
//! `desired_config_name` and `desired_config_hash` are owned by the push
//! path: [`Registry::register_or_update`] never touches them, and they
//! change only through [`Registry::set_desired_config`], which atomically
//! sets the apply status to [`ApplyStatus::Pending`]. Apply reports update
//! the status but never the desired hash.
//!
//! # Events
//!
//! Subscribers receive [`RegistryEvent`]s on detached tasks; emission never
//! blocks the caller, and a panicking handler terminates only its own task.
//! Ordering across handlers is not guaranteed.

pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{Agent, AgentFilter, AgentStatus, ApplyStatus};

/// Kind of a registry lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    /// An agent transitioned to connected (including first contact).
    AgentConnected,
    /// An agent's session closed.
    AgentDisconnected,
    /// An agent record changed outside of connect/disconnect.
    AgentUpdated,
    /// An agent reported its desired configuration as applied.
    ConfigApplied,
    /// An agent reported a failure applying its desired configuration.
    ConfigFailed,
}

impl std::fmt::Display for RegistryEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentConnected => write!(f, "agent_connected"),
            Self::AgentDisconnected => write!(f, "agent_disconnected"),
            Self::AgentUpdated => write!(f, "agent_updated"),
            Self::ConfigApplied => write!(f, "config_applied"),
            Self::ConfigFailed => write!(f, "config_failed"),
        }
    }
}

/// A registry lifecycle event delivered to subscribers.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    /// What happened.
    pub kind: RegistryEventKind,
    /// The agent record as of the event.
    pub agent: Agent,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

/// Handler invoked for each registry event. Handlers run on detached tasks
/// and must be reentrant; a slow handler delays only itself.
pub type EventHandler = Arc<dyn Fn(RegistryEvent) + Send + Sync>;

/// Opaque handle returned by [`Registry::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The persistence layer failed.
    #[error("registry storage error: {message}")]
    Storage {
        /// Underlying failure description.
        message: String,
    },

    /// The requested agent does not exist.
    #[error("agent not found: {uid}")]
    NotFound {
        /// The missing instance UID.
        uid: String,
    },
}

/// Durable store of agent records.
///
/// Implementations must serialize writes; reads may be concurrent. No
/// operation silently drops a failure.
pub trait Registry: Send + Sync {
    /// Upserts an agent keyed on `instance_uid`. On conflict overwrites
    /// description, labels, status, last-seen, capabilities, and the update
    /// timestamp, but preserves the desired configuration name/hash and the
    /// apply status.
    fn register_or_update(&self, agent: &Agent) -> Result<(), RegistryError>;

    /// Overwrites the full record. Fails with [`RegistryError::NotFound`]
    /// when the key is absent.
    fn update(&self, agent: &Agent) -> Result<(), RegistryError>;

    /// Fetches an agent by instance UID.
    fn get(&self, uid: &str) -> Result<Option<Agent>, RegistryError>;

    /// Lists agents matching the filter, ordered by last-seen descending.
    fn list(&self, filter: &AgentFilter) -> Result<Vec<Agent>, RegistryError>;

    /// Removes an agent. Fails with [`RegistryError::NotFound`] when the key
    /// is absent.
    fn delete(&self, uid: &str) -> Result<(), RegistryError>;

    /// Updates the connection status and bumps last-seen.
    fn update_status(&self, uid: &str, status: AgentStatus) -> Result<(), RegistryError>;

    /// Records a pushed configuration: sets the desired name and hash and
    /// the apply status to [`ApplyStatus::Pending`] in one atomic write.
    fn set_desired_config(&self, uid: &str, name: &str, hash: &str) -> Result<(), RegistryError>;

    /// Records an agent's apply report. Never modifies the desired hash; an
    /// `applied` report whose hash does not match the current desired hash
    /// is recorded as [`ApplyStatus::Unknown`].
    fn update_apply(
        &self,
        uid: &str,
        reported_hash: &str,
        status: ApplyStatus,
        error: Option<&str>,
    ) -> Result<(), RegistryError>;

    /// Bumps the last-seen timestamp. A missing record is not an error; the
    /// session path must not stall on a racing delete.
    fn record_heartbeat(&self, uid: &str) -> Result<(), RegistryError>;

    /// Returns connected agents whose last-seen timestamp is older than
    /// `now - threshold`. The registry performs no timed cleanup itself.
    fn list_stale(&self, threshold: Duration) -> Result<Vec<Agent>, RegistryError>;

    /// Registers an event handler.
    fn subscribe(&self, handler: EventHandler) -> SubscriptionId;

    /// Removes a previously registered handler. Unknown IDs are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

impl RegistryEvent {
    /// Builds an event stamped with the current time.
    #[must_use]
    pub fn now(kind: RegistryEventKind, agent: Agent) -> Self {
        Self {
            kind,
            agent,
            timestamp: Utc::now(),
        }
    }
}
