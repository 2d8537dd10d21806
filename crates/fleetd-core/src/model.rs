//! Shared domain types for the control plane.
//!
//! These types cross every component boundary: the registry persists them,
//! the resolver consumes them, and the daemon serializes them over the admin
//! API. Keep them plain data; behavior lives in the owning components.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Connection status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// The agent has a live session.
    Connected,
    /// The agent's last session was closed.
    Disconnected,
    /// The agent has never been seen on a session.
    #[default]
    Unknown,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// Status of configuration application on an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// A configuration was pushed and the agent has not yet reported on it.
    Pending,
    /// The agent reported the desired configuration as applied.
    Applied,
    /// The agent reported a failure applying the desired configuration.
    Failed,
    /// No report, or a report that could not be correlated.
    #[default]
    Unknown,
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ApplyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown apply status: {other}")),
        }
    }
}

/// Agent-reported metadata, split into the attributes that identify the
/// installation and the ones that merely describe it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentDescription {
    /// Attributes that identify the agent installation. Promoted verbatim
    /// into [`Agent::labels`] for selector matching.
    #[serde(default)]
    pub identifying_attributes: BTreeMap<String, String>,
    /// Attributes that describe but do not identify the agent.
    #[serde(default)]
    pub non_identifying_attributes: BTreeMap<String, String>,
}

/// A managed telemetry agent as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Opaque stable identifier bound to the agent's installation identity.
    pub instance_uid: String,
    /// Agent-reported metadata.
    #[serde(default)]
    pub description: AgentDescription,
    /// Labels used for selector matching, derived from identifying
    /// attributes.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Current connection status.
    #[serde(default)]
    pub status: AgentStatus,
    /// Timestamp of the most recent message from this agent.
    pub last_seen: DateTime<Utc>,
    /// Name of the configuration the control plane last chose to push.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_config_name: Option<String>,
    /// Fingerprint of the configuration the control plane last chose to
    /// push. Owned by the push path; changes only together with a `pending`
    /// apply status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_config_hash: Option<String>,
    /// The agent's report on the last pushed configuration.
    #[serde(default)]
    pub applied_config_status: ApplyStatus,
    /// Error message from the agent when the apply status is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
    /// Opaque capability bit-set reported by the agent.
    #[serde(default)]
    pub capabilities: u64,
    /// When the agent was first registered.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Creates a fresh record for an agent seen for the first time.
    #[must_use]
    pub fn new(instance_uid: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_uid: instance_uid.into(),
            description: AgentDescription::default(),
            labels: BTreeMap::new(),
            status: AgentStatus::Unknown,
            last_seen: now,
            desired_config_name: None,
            desired_config_hash: None,
            applied_config_status: ApplyStatus::Unknown,
            apply_error: None,
            capabilities: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter criteria for listing agents. All present criteria must hold;
/// label matching is conjunctive equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    /// Restrict to agents with this connection status.
    pub status: Option<AgentStatus>,
    /// Every entry must be present in the agent's labels with equal value.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Restrict to agents with this apply status.
    pub apply_status: Option<ApplyStatus>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Number of records to skip.
    pub offset: Option<usize>,
}

/// Matching criteria for a configuration selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SelectorMatch {
    /// Labels that must all be present with equal values. An empty mapping
    /// matches nothing.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A labeled rule mapping agent labels to a configuration file and an
/// optional overlay. Selectors form an ordered sequence; the first match in
/// file order wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSelector {
    /// Name of the selector, used as the effective configuration name.
    pub name: String,
    /// Matching criteria.
    #[serde(rename = "match", default)]
    pub matches: SelectorMatch,
    /// Agent configuration path, relative to the `agents/` directory.
    pub config: String,
    /// Name of an overlay to merge between base and agent config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<String>,
    /// Reserved for future ordering; evaluation order is file order.
    #[serde(default)]
    pub priority: i32,
}

/// Top-level structure of the `agents/_selectors.yaml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorsFile {
    /// The ordered selector sequence.
    #[serde(default)]
    pub selectors: Vec<ConfigSelector>,
}

/// A fully resolved configuration for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    /// Name of the configuration (the selector name, or `base`).
    pub name: String,
    /// Lowercase-hex SHA-256 of `content`. The canonical identity a push is
    /// keyed by; agents echo it back in apply reports.
    pub fingerprint: String,
    /// The merged document bytes.
    pub content: Vec<u8>,
    /// Name of the selector that produced this configuration; empty for the
    /// base fallback.
    pub source_selector_name: String,
}

/// Computes the canonical fingerprint of configuration content: the SHA-256
/// digest rendered as lowercase hexadecimal.
#[must_use]
pub fn fingerprint(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
