//! Wire messages for the agent protocol.
//!
//! Hand-written prost structs covering the subset of the OpAMP message
//! surface this control plane consumes and produces. Field tags follow the
//! protocol's wire layout so real agents interoperate; fields the control
//! plane ignores are simply not declared (protobuf skips unknown fields).
//!
//! `AgentRemoteConfig::config_hash` carries the lowercase-hex fingerprint
//! as ASCII bytes, not a raw digest; agents echo these bytes back in
//! `RemoteConfigStatus::last_remote_config_hash`.

use std::collections::BTreeMap;
use std::collections::HashMap;

use prost::Message;

use fleetd_core::model::ApplyStatus;

/// A message sent from an agent to the server.
#[derive(Clone, PartialEq, Message)]
pub struct AgentToServer {
    /// Stable installation identity of the sending agent.
    #[prost(bytes = "vec", tag = "1")]
    pub instance_uid: Vec<u8>,
    /// Agent metadata; present when it changed since the last report.
    #[prost(message, optional, tag = "3")]
    pub agent_description: Option<AgentDescription>,
    /// Opaque capability bit-set.
    #[prost(uint64, tag = "4")]
    pub capabilities: u64,
    /// The agent's report on the last received remote configuration.
    #[prost(message, optional, tag = "7")]
    pub remote_config_status: Option<RemoteConfigStatus>,
}

/// A message sent from the server to an agent. Every inbound message gets
/// exactly one reply, with or without an attached configuration.
#[derive(Clone, PartialEq, Message)]
pub struct ServerToAgent {
    /// Echo of the agent's installation identity.
    #[prost(bytes = "vec", tag = "1")]
    pub instance_uid: Vec<u8>,
    /// New desired configuration, when the fingerprint changed.
    #[prost(message, optional, tag = "3")]
    pub remote_config: Option<AgentRemoteConfig>,
}

/// Agent metadata attributes.
#[derive(Clone, PartialEq, Message)]
pub struct AgentDescription {
    /// Attributes identifying the installation; promoted into labels.
    #[prost(message, repeated, tag = "1")]
    pub identifying_attributes: Vec<KeyValue>,
    /// Attributes describing but not identifying the installation.
    #[prost(message, repeated, tag = "2")]
    pub non_identifying_attributes: Vec<KeyValue>,
}

/// One attribute.
#[derive(Clone, PartialEq, Message)]
pub struct KeyValue {
    /// Attribute key.
    #[prost(string, tag = "1")]
    pub key: String,
    /// Attribute value.
    #[prost(message, optional, tag = "2")]
    pub value: Option<AnyValue>,
}

/// Attribute value. Only string values participate in label matching.
#[derive(Clone, PartialEq, Message)]
pub struct AnyValue {
    /// String payload.
    #[prost(string, optional, tag = "1")]
    pub string_value: Option<String>,
}

/// The agent's report on the last remote configuration it received.
#[derive(Clone, PartialEq, Message)]
pub struct RemoteConfigStatus {
    /// Echo of the `config_hash` bytes the server sent.
    #[prost(bytes = "vec", tag = "1")]
    pub last_remote_config_hash: Vec<u8>,
    /// Application outcome.
    #[prost(enumeration = "RemoteConfigStatuses", tag = "2")]
    pub status: i32,
    /// Human-readable error when the status is `Failed`.
    #[prost(string, tag = "3")]
    pub error_message: String,
}

/// Remote configuration application outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RemoteConfigStatuses {
    /// No status reported.
    Unset = 0,
    /// The configuration was applied.
    Applied = 1,
    /// The configuration is being applied.
    Applying = 2,
    /// The configuration failed to apply.
    Failed = 3,
}

/// A configuration pushed to an agent.
#[derive(Clone, PartialEq, Message)]
pub struct AgentRemoteConfig {
    /// The configuration file map.
    #[prost(message, optional, tag = "1")]
    pub config: Option<AgentConfigMap>,
    /// Lowercase-hex fingerprint of the configuration body, as ASCII bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub config_hash: Vec<u8>,
}

/// Named configuration files.
#[derive(Clone, PartialEq, Message)]
pub struct AgentConfigMap {
    /// Files keyed by name; this control plane always sends exactly
    /// `collector.yaml`.
    #[prost(map = "string, message", tag = "1")]
    pub config_map: HashMap<String, AgentConfigFile>,
}

/// One configuration file.
#[derive(Clone, PartialEq, Message)]
pub struct AgentConfigFile {
    /// File contents.
    #[prost(bytes = "vec", tag = "1")]
    pub body: Vec<u8>,
    /// MIME type of `body`.
    #[prost(string, tag = "2")]
    pub content_type: String,
}

/// Collapses repeated key-values into a string map, keeping only entries
/// with string values. Later duplicates win.
#[must_use]
pub fn key_values_to_map(attrs: &[KeyValue]) -> BTreeMap<String, String> {
    attrs
        .iter()
        .filter_map(|kv| {
            let value = kv.value.as_ref()?.string_value.as_ref()?;
            if value.is_empty() {
                return None;
            }
            Some((kv.key.clone(), value.clone()))
        })
        .collect()
}

/// Translates a reported protocol status into the registry's apply status.
#[must_use]
pub fn apply_status_from_wire(status: i32) -> ApplyStatus {
    match RemoteConfigStatuses::try_from(status) {
        Ok(RemoteConfigStatuses::Applied) => ApplyStatus::Applied,
        Ok(RemoteConfigStatuses::Applying) => ApplyStatus::Pending,
        Ok(RemoteConfigStatuses::Failed) => ApplyStatus::Failed,
        Ok(RemoteConfigStatuses::Unset) | Err(_) => ApplyStatus::Unknown,
    }
}

/// Encodes a server message to wire bytes.
#[must_use]
pub fn encode(message: &ServerToAgent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .expect("Vec<u8> buffer never runs out of capacity");
    buf
}
