//! OpAMP session server.
//!
//! One WebSocket connection per agent. Each connection gets a writer task
//! fed by an mpsc channel; replies and out-of-band pushes share that
//! channel, so a session's outbound messages are FIFO. The session table
//! maps `instance_uid` to the live send handle; the handle stores the UID
//! so disconnect cleanup never scans the table.
//!
//! # Ordering
//!
//! Within one session, messages are processed in arrival order and every
//! message gets exactly one reply. The registry's desired-hash/pending
//! write happens before the reply or push is handed to the writer, so no
//! apply report can arrive for an unrecorded desired hash.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fleetd_core::model::{Agent, AgentStatus, EffectiveConfig};
use fleetd_core::registry::Registry;
use fleetd_core::resolve::Resolver;

use super::proto::{
    self, AgentConfigFile, AgentConfigMap, AgentRemoteConfig, AgentToServer, ServerToAgent,
    apply_status_from_wire, key_values_to_map,
};

/// Key under which the merged document travels in the config map.
const CONFIG_MAP_KEY: &str = "collector.yaml";

/// Content type of the merged document.
const CONFIG_CONTENT_TYPE: &str = "text/yaml";

/// Outbound channel depth per session. A slow agent back-pressures its own
/// session only.
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Live session handle: the agent's UID plus the channel feeding its
/// writer task.
#[derive(Clone)]
struct SessionHandle {
    instance_uid: String,
    tx: mpsc::Sender<ServerToAgent>,
}

/// The agent session server.
pub struct OpampServer {
    registry: Arc<dyn Registry>,
    resolver: Arc<Resolver>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl std::fmt::Debug for OpampServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpampServer")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl OpampServer {
    /// Creates the session server.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>, resolver: Arc<Resolver>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            resolver,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the router serving the agent protocol endpoint.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/v1/opamp", get(ws_upgrade))
            .with_state(Arc::clone(self))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drives one agent connection to completion.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<ServerToAgent>(SESSION_CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                let frame = Message::Binary(proto::encode(&reply).into());
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let mut session_uid: Option<String> = None;
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Binary(data)) => match AgentToServer::decode(data.as_ref()) {
                    Ok(msg) => {
                        let uid = String::from_utf8_lossy(&msg.instance_uid).into_owned();
                        if uid.is_empty() {
                            warn!("agent message without instance uid, dropping");
                            continue;
                        }
                        session_uid.get_or_insert_with(|| uid.clone());
                        let reply = self.on_message(msg, &tx);
                        if tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "undecodable agent frame, dropping"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "agent socket read failed");
                    break;
                }
            }
        }

        // Remove the session entry before the status write so a connected
        // record always has a live handle.
        if let Some(uid) = session_uid {
            self.close_session(&uid, &tx);
        }
        drop(tx);
        let _ = writer.await;
    }

    /// Processes one inbound message and builds the reply.
    ///
    /// Exposed at crate level so tests can drive the session layer through
    /// an in-process channel instead of a socket.
    pub(crate) fn on_message(
        &self,
        msg: AgentToServer,
        tx: &mpsc::Sender<ServerToAgent>,
    ) -> ServerToAgent {
        let uid = String::from_utf8_lossy(&msg.instance_uid).into_owned();
        let mut reply = ServerToAgent {
            instance_uid: msg.instance_uid.clone(),
            remote_config: None,
        };

        if self.register_session(&uid, tx) {
            info!(uid, "agent session established");
            let agent = agent_from_message(&uid, &msg);
            if let Err(err) = self.registry.register_or_update(&agent) {
                warn!(uid, error = %err, "failed to register agent");
            }
        }

        if let Err(err) = self.registry.record_heartbeat(&uid) {
            debug!(uid, error = %err, "failed to record heartbeat");
        }

        if let Some(description) = &msg.agent_description {
            self.apply_description(&uid, description);
        }

        if let Some(status) = &msg.remote_config_status {
            let hash = String::from_utf8_lossy(&status.last_remote_config_hash).into_owned();
            let apply = apply_status_from_wire(status.status);
            let error = (!status.error_message.is_empty()).then_some(status.error_message.as_str());
            if let Some(message) = error {
                warn!(uid, error = message, "agent reported config apply failure");
            }
            if let Err(err) = self.registry.update_apply(&uid, &hash, apply, error) {
                warn!(uid, error = %err, "failed to record apply report");
            }
        }

        match self.registry.get(&uid) {
            Ok(Some(agent)) => {
                if let Some(config) = self.desired_update(&agent) {
                    info!(
                        uid,
                        config = %config.name,
                        fingerprint = %config.fingerprint,
                        "sending configuration to agent"
                    );
                    reply.remote_config = Some(remote_config(&config));
                }
            }
            Ok(None) => {}
            Err(err) => warn!(uid, error = %err, "failed to load agent for reconciliation"),
        }

        reply
    }

    /// Pushes the current effective configuration to one agent. A push to
    /// an agent without a live session is a silent no-op; reconnect
    /// reconciliation covers it.
    ///
    /// Returns whether a configuration was sent.
    pub async fn push_to(&self, uid: &str) -> bool {
        let Some(handle) = self.session(uid) else {
            debug!(uid, "push skipped, agent not connected");
            return false;
        };
        self.push_session(&handle).await
    }

    /// Pushes to every live session. The session table is snapshotted
    /// first so no lock is held across sends. Returns the number of agents
    /// that received a new configuration.
    pub async fn push_to_all(&self) -> usize {
        let handles: Vec<SessionHandle> = {
            let sessions = self
                .sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            sessions.values().cloned().collect()
        };

        let mut sent = 0;
        for handle in handles {
            if self.push_session(&handle).await {
                sent += 1;
            }
        }
        sent
    }

    async fn push_session(&self, handle: &SessionHandle) -> bool {
        let uid = &handle.instance_uid;
        let agent = match self.registry.get(uid) {
            Ok(Some(agent)) => agent,
            Ok(None) => return false,
            Err(err) => {
                warn!(uid, error = %err, "failed to load agent for push");
                return false;
            }
        };

        let Some(config) = self.desired_update(&agent) else {
            return false;
        };

        let message = ServerToAgent {
            instance_uid: uid.clone().into_bytes(),
            remote_config: Some(remote_config(&config)),
        };
        if handle.tx.send(message).await.is_err() {
            // The session closed under us; the pending mark stands and
            // reconnect reconciliation will resend.
            debug!(uid, "push send failed, session closed");
            return false;
        }
        info!(
            uid,
            config = %config.name,
            fingerprint = %config.fingerprint,
            "pushed configuration to agent"
        );
        true
    }

    /// Resolves the agent and, when the fingerprint differs from the
    /// recorded desired hash, marks the registry pending and returns the
    /// configuration to send. The registry write strictly precedes any
    /// send.
    fn desired_update(&self, agent: &Agent) -> Option<EffectiveConfig> {
        let config = match self.resolver.resolve(agent) {
            Ok(Some(config)) => config,
            Ok(None) => return None,
            Err(err) => {
                // The agent keeps its previous configuration.
                warn!(
                    uid = %agent.instance_uid,
                    error = %err,
                    "resolution failed, not pushing"
                );
                return None;
            }
        };

        if agent.desired_config_hash.as_deref() == Some(config.fingerprint.as_str()) {
            return None;
        }

        if let Err(err) = self.registry.set_desired_config(
            &agent.instance_uid,
            &config.name,
            &config.fingerprint,
        ) {
            warn!(
                uid = %agent.instance_uid,
                error = %err,
                "failed to record desired config, not pushing"
            );
            return None;
        }
        Some(config)
    }

    /// Inserts this connection's handle for the UID. A newer connection for
    /// the same UID supersedes a stale one. Returns whether this was first
    /// contact for this connection.
    fn register_session(&self, uid: &str, tx: &mpsc::Sender<ServerToAgent>) -> bool {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(uid) {
            if existing.tx.same_channel(tx) {
                return false;
            }
        }
        sessions.insert(
            uid.to_string(),
            SessionHandle {
                instance_uid: uid.to_string(),
                tx: tx.clone(),
            },
        );
        true
    }

    fn session(&self, uid: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    /// Removes the session entry, then transitions the registry record to
    /// disconnected. The entry is matched by handle identity: a close from
    /// a superseded connection must not tear down its successor's session.
    pub(crate) fn close_session(&self, uid: &str, tx: &mpsc::Sender<ServerToAgent>) {
        let removed = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match sessions.get(uid) {
                Some(existing) if existing.tx.same_channel(tx) => {
                    sessions.remove(uid);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return;
        }
        info!(uid, "agent session closed");
        if let Err(err) = self.registry.update_status(uid, AgentStatus::Disconnected) {
            warn!(uid, error = %err, "failed to mark agent disconnected");
        }
    }

    fn apply_description(&self, uid: &str, description: &super::proto::AgentDescription) {
        let mut agent = match self.registry.get(uid) {
            Ok(Some(agent)) => agent,
            Ok(None) => return,
            Err(err) => {
                warn!(uid, error = %err, "failed to load agent for description update");
                return;
            }
        };

        let identifying = key_values_to_map(&description.identifying_attributes);
        // Identifying attributes merge into the label set; keys absent from
        // the new description keep their previous values.
        for (key, value) in &identifying {
            agent.labels.insert(key.clone(), value.clone());
        }
        agent.description.identifying_attributes = identifying;
        agent.description.non_identifying_attributes =
            key_values_to_map(&description.non_identifying_attributes);

        if let Err(err) = self.registry.update(&agent) {
            warn!(uid, error = %err, "failed to update agent description");
        }
    }
}

async fn ws_upgrade(
    State(server): State<Arc<OpampServer>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move { server.handle_socket(socket).await })
}

fn agent_from_message(uid: &str, msg: &AgentToServer) -> Agent {
    let mut agent = Agent::new(uid);
    agent.status = AgentStatus::Connected;
    agent.capabilities = msg.capabilities;
    if let Some(description) = &msg.agent_description {
        agent.description.identifying_attributes =
            key_values_to_map(&description.identifying_attributes);
        agent.description.non_identifying_attributes =
            key_values_to_map(&description.non_identifying_attributes);
        agent.labels = agent.description.identifying_attributes.clone();
    }
    agent
}

fn remote_config(config: &EffectiveConfig) -> AgentRemoteConfig {
    AgentRemoteConfig {
        config: Some(AgentConfigMap {
            config_map: HashMap::from([(
                CONFIG_MAP_KEY.to_string(),
                AgentConfigFile {
                    body: config.content.clone(),
                    content_type: CONFIG_CONTENT_TYPE.to_string(),
                },
            )]),
        }),
        // ASCII hex bytes, not the raw digest.
        config_hash: config.fingerprint.clone().into_bytes(),
    }
}
