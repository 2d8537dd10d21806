//! SQLite-backed registry implementation.
//!
//! One table, `agents`, keyed by `instance_uid`. The description and label
//! mappings are stored as JSON text columns; timestamps are UNIX
//! milliseconds. The database runs in WAL mode so that a crash between a
//! push and the following apply update cannot tear an acknowledged write.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, warn};

use super::{
    EventHandler, Registry, RegistryError, RegistryEvent, RegistryEventKind, SubscriptionId,
};
use crate::model::{Agent, AgentFilter, AgentStatus, ApplyStatus};

/// Durable agent registry backed by SQLite.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    handlers: Mutex<HashMap<u64, EventHandler>>,
    next_handler_id: AtomicU64,
}

impl std::fmt::Debug for SqliteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRegistry").finish_non_exhaustive()
    }
}

impl SqliteRegistry {
    /// Opens (or creates) the registry database at `path` and runs schema
    /// migration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the database cannot be opened
    /// or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let conn = Connection::open(path.as_ref()).map_err(storage_err)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory registry. State does not survive the process;
    /// intended for tests.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the database cannot be created.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(storage_err)?;
        Self::init_schema(&conn).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            handlers: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                instance_uid TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '{}',
                labels TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'unknown',
                last_seen INTEGER NOT NULL DEFAULT 0,
                desired_config_name TEXT,
                desired_config_hash TEXT,
                applied_config_status TEXT NOT NULL DEFAULT 'unknown',
                apply_error TEXT,
                capabilities INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
            CREATE INDEX IF NOT EXISTS idx_agents_last_seen ON agents(last_seen);
            CREATE INDEX IF NOT EXISTS idx_agents_applied_config_status
                ON agents(applied_config_status);",
        )
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers an event to all subscribers without blocking the caller.
    ///
    /// Inside a Tokio runtime each handler runs on its own task; outside one
    /// (plain unit tests) handlers run inline.
    fn emit(&self, kind: RegistryEventKind, agent: Agent) {
        let handlers: Vec<EventHandler> = {
            let guard = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.values().cloned().collect()
        };
        if handlers.is_empty() {
            return;
        }
        let event = RegistryEvent::now(kind, agent);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for handler in handlers {
                    let event = event.clone();
                    handle.spawn(async move { handler(event) });
                }
            }
            Err(_) => {
                for handler in handlers {
                    handler(event.clone());
                }
            }
        }
    }

    fn emit_for(&self, conn: &Connection, uid: &str, kind: RegistryEventKind) {
        match get_agent(conn, uid) {
            Ok(Some(agent)) => self.emit(kind, agent),
            Ok(None) => {}
            Err(err) => debug!(uid, error = %err, "skipping event emit, re-read failed"),
        }
    }
}

impl Registry for SqliteRegistry {
    fn register_or_update(&self, agent: &Agent) -> Result<(), RegistryError> {
        let description = to_json(&agent.description)?;
        let labels = to_json(&agent.labels)?;
        let now = Utc::now();

        let conn = self.lock();
        conn.execute(
            "INSERT INTO agents (
                instance_uid, description, labels, status, last_seen,
                desired_config_name, desired_config_hash, applied_config_status,
                apply_error, capabilities, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(instance_uid) DO UPDATE SET
                description = excluded.description,
                labels = excluded.labels,
                status = excluded.status,
                last_seen = excluded.last_seen,
                capabilities = excluded.capabilities,
                updated_at = excluded.updated_at",
            params![
                agent.instance_uid,
                description,
                labels,
                agent.status.to_string(),
                millis(agent.last_seen),
                agent.desired_config_name,
                agent.desired_config_hash,
                agent.applied_config_status.to_string(),
                agent.apply_error,
                i64::from_ne_bytes(agent.capabilities.to_ne_bytes()),
                millis(now),
                millis(now),
            ],
        )
        .map_err(storage_err)?;

        let kind = if agent.status == AgentStatus::Connected {
            RegistryEventKind::AgentConnected
        } else {
            RegistryEventKind::AgentUpdated
        };
        self.emit_for(&conn, &agent.instance_uid, kind);
        Ok(())
    }

    fn update(&self, agent: &Agent) -> Result<(), RegistryError> {
        let description = to_json(&agent.description)?;
        let labels = to_json(&agent.labels)?;
        let now = Utc::now();

        let conn = self.lock();
        let rows = conn
            .execute(
                "UPDATE agents SET
                    description = ?1, labels = ?2, status = ?3, last_seen = ?4,
                    desired_config_name = ?5, desired_config_hash = ?6,
                    applied_config_status = ?7, apply_error = ?8,
                    capabilities = ?9, updated_at = ?10
                WHERE instance_uid = ?11",
                params![
                    description,
                    labels,
                    agent.status.to_string(),
                    millis(agent.last_seen),
                    agent.desired_config_name,
                    agent.desired_config_hash,
                    agent.applied_config_status.to_string(),
                    agent.apply_error,
                    i64::from_ne_bytes(agent.capabilities.to_ne_bytes()),
                    millis(now),
                    agent.instance_uid,
                ],
            )
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(RegistryError::NotFound {
                uid: agent.instance_uid.clone(),
            });
        }

        self.emit_for(&conn, &agent.instance_uid, RegistryEventKind::AgentUpdated);
        Ok(())
    }

    fn get(&self, uid: &str) -> Result<Option<Agent>, RegistryError> {
        let conn = self.lock();
        get_agent(&conn, uid)
    }

    fn list(&self, filter: &AgentFilter) -> Result<Vec<Agent>, RegistryError> {
        let mut sql = String::from(
            "SELECT instance_uid, description, labels, status, last_seen,
                desired_config_name, desired_config_hash, applied_config_status,
                apply_error, capabilities, created_at, updated_at
            FROM agents WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.to_string()));
        }
        if let Some(apply_status) = filter.apply_status {
            sql.push_str(" AND applied_config_status = ?");
            args.push(Box::new(apply_status.to_string()));
        }
        sql.push_str(" ORDER BY last_seen DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit as i64));
        }
        if let Some(offset) = filter.offset {
            sql.push_str(" OFFSET ?");
            args.push(Box::new(offset as i64));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let params = rusqlite::params_from_iter(args.iter().map(|arg| &**arg));
        let rows = stmt
            .query_map(params, row_to_agent)
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        // Label filtering happens in memory; the labels live in a JSON
        // column and the filter is conjunctive equality.
        let agents = rows
            .into_iter()
            .filter(|agent| {
                filter
                    .labels
                    .iter()
                    .all(|(k, v)| agent.labels.get(k) == Some(v))
            })
            .collect();
        Ok(agents)
    }

    fn delete(&self, uid: &str) -> Result<(), RegistryError> {
        let conn = self.lock();
        let rows = conn
            .execute("DELETE FROM agents WHERE instance_uid = ?1", params![uid])
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(RegistryError::NotFound {
                uid: uid.to_string(),
            });
        }
        Ok(())
    }

    fn update_status(&self, uid: &str, status: AgentStatus) -> Result<(), RegistryError> {
        let now = millis(Utc::now());
        let conn = self.lock();
        let rows = conn
            .execute(
                "UPDATE agents SET status = ?1, last_seen = ?2, updated_at = ?2
                 WHERE instance_uid = ?3",
                params![status.to_string(), now, uid],
            )
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(RegistryError::NotFound {
                uid: uid.to_string(),
            });
        }

        let kind = match status {
            AgentStatus::Connected => RegistryEventKind::AgentConnected,
            AgentStatus::Disconnected => RegistryEventKind::AgentDisconnected,
            AgentStatus::Unknown => RegistryEventKind::AgentUpdated,
        };
        self.emit_for(&conn, uid, kind);
        Ok(())
    }

    fn set_desired_config(&self, uid: &str, name: &str, hash: &str) -> Result<(), RegistryError> {
        let now = millis(Utc::now());
        let conn = self.lock();
        // One statement: the desired hash must never be observable without
        // the pending status.
        let rows = conn
            .execute(
                "UPDATE agents SET
                    desired_config_name = ?1,
                    desired_config_hash = ?2,
                    applied_config_status = 'pending',
                    apply_error = NULL,
                    updated_at = ?3
                WHERE instance_uid = ?4",
                params![name, hash, now, uid],
            )
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(RegistryError::NotFound {
                uid: uid.to_string(),
            });
        }

        self.emit_for(&conn, uid, RegistryEventKind::AgentUpdated);
        Ok(())
    }

    fn update_apply(
        &self,
        uid: &str,
        reported_hash: &str,
        status: ApplyStatus,
        error: Option<&str>,
    ) -> Result<(), RegistryError> {
        let now = millis(Utc::now());
        let conn = self.lock();

        let agent = get_agent(&conn, uid)?.ok_or_else(|| RegistryError::NotFound {
            uid: uid.to_string(),
        })?;

        let effective = if status == ApplyStatus::Applied
            && agent.desired_config_hash.as_deref() != Some(reported_hash)
        {
            warn!(
                uid,
                reported_hash,
                desired_hash = agent.desired_config_hash.as_deref().unwrap_or(""),
                "applied report does not match desired hash, recording unknown"
            );
            ApplyStatus::Unknown
        } else {
            status
        };

        conn.execute(
            "UPDATE agents SET
                applied_config_status = ?1, apply_error = ?2, updated_at = ?3
            WHERE instance_uid = ?4",
            params![effective.to_string(), error, now, uid],
        )
        .map_err(storage_err)?;

        let kind = match effective {
            ApplyStatus::Applied => RegistryEventKind::ConfigApplied,
            ApplyStatus::Failed => RegistryEventKind::ConfigFailed,
            ApplyStatus::Pending | ApplyStatus::Unknown => RegistryEventKind::AgentUpdated,
        };
        self.emit_for(&conn, uid, kind);
        Ok(())
    }

    fn record_heartbeat(&self, uid: &str) -> Result<(), RegistryError> {
        let now = millis(Utc::now());
        let conn = self.lock();
        conn.execute(
            "UPDATE agents SET last_seen = ?1, updated_at = ?1 WHERE instance_uid = ?2",
            params![now, uid],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn list_stale(&self, threshold: Duration) -> Result<Vec<Agent>, RegistryError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT instance_uid, description, labels, status, last_seen,
                    desired_config_name, desired_config_hash, applied_config_status,
                    apply_error, capabilities, created_at, updated_at
                FROM agents
                WHERE status = 'connected' AND last_seen < ?1
                ORDER BY last_seen DESC",
            )
            .map_err(storage_err)?;
        let agents = stmt
            .query_map(params![millis(cutoff)], row_to_agent)
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(agents)
    }

    fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handler);
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0);
    }
}

fn storage_err(err: rusqlite::Error) -> RegistryError {
    RegistryError::Storage {
        message: err.to_string(),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RegistryError> {
    serde_json::to_string(value).map_err(|e| RegistryError::Storage {
        message: format!("serialization failed: {e}"),
    })
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn get_agent(conn: &Connection, uid: &str) -> Result<Option<Agent>, RegistryError> {
    conn.query_row(
        "SELECT instance_uid, description, labels, status, last_seen,
            desired_config_name, desired_config_hash, applied_config_status,
            apply_error, capabilities, created_at, updated_at
        FROM agents WHERE instance_uid = ?1",
        params![uid],
        row_to_agent,
    )
    .optional()
    .map_err(storage_err)
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let description: String = row.get(1)?;
    let labels: String = row.get(2)?;
    let status: String = row.get(3)?;
    let applied: String = row.get(7)?;
    let capabilities: i64 = row.get(9)?;

    Ok(Agent {
        instance_uid: row.get(0)?,
        description: serde_json::from_str(&description).unwrap_or_default(),
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        status: status.parse().unwrap_or_default(),
        last_seen: from_millis(row.get(4)?),
        desired_config_name: row.get(5)?,
        desired_config_hash: row.get(6)?,
        applied_config_status: applied.parse().unwrap_or_default(),
        apply_error: row.get(8)?,
        capabilities: u64::from_ne_bytes(capabilities.to_ne_bytes()),
        created_at: from_millis(row.get(10)?),
        updated_at: from_millis(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn registry() -> SqliteRegistry {
        SqliteRegistry::open_in_memory().unwrap()
    }

    fn connected_agent(uid: &str) -> Agent {
        let mut agent = Agent::new(uid);
        agent.status = AgentStatus::Connected;
        agent.labels = BTreeMap::from([
            ("deployment".to_string(), "kubernetes".to_string()),
            ("role".to_string(), "daemonset".to_string()),
        ]);
        agent
    }

    #[test]
    fn test_register_then_get_round_trips() {
        let reg = registry();
        let agent = connected_agent("agent-1");
        reg.register_or_update(&agent).unwrap();

        let stored = reg.get("agent-1").unwrap().unwrap();
        assert_eq!(stored.instance_uid, "agent-1");
        assert_eq!(stored.status, AgentStatus::Connected);
        assert_eq!(stored.labels, agent.labels);
        assert_eq!(stored.applied_config_status, ApplyStatus::Unknown);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let reg = registry();
        assert!(reg.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_register_or_update_preserves_desired_config() {
        // The push path owns desired_config_hash and the apply status; a
        // reconnecting agent must not clear them.
        let reg = registry();
        reg.register_or_update(&connected_agent("agent-1")).unwrap();
        reg.set_desired_config("agent-1", "kubernetes-daemonset", "abc123")
            .unwrap();

        let mut reconnect = connected_agent("agent-1");
        reconnect.capabilities = 7;
        reg.register_or_update(&reconnect).unwrap();

        let stored = reg.get("agent-1").unwrap().unwrap();
        assert_eq!(stored.capabilities, 7);
        assert_eq!(stored.desired_config_hash.as_deref(), Some("abc123"));
        assert_eq!(
            stored.desired_config_name.as_deref(),
            Some("kubernetes-daemonset")
        );
        assert_eq!(stored.applied_config_status, ApplyStatus::Pending);
    }

    #[test]
    fn test_update_missing_agent_is_not_found() {
        let reg = registry();
        let err = reg.update(&connected_agent("ghost")).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn test_set_desired_config_marks_pending_and_clears_error() {
        let reg = registry();
        reg.register_or_update(&connected_agent("agent-1")).unwrap();
        reg.set_desired_config("agent-1", "cfg", "hash-1").unwrap();
        reg.update_apply("agent-1", "hash-1", ApplyStatus::Failed, Some("bad exporter"))
            .unwrap();

        reg.set_desired_config("agent-1", "cfg", "hash-2").unwrap();
        let stored = reg.get("agent-1").unwrap().unwrap();
        assert_eq!(stored.desired_config_hash.as_deref(), Some("hash-2"));
        assert_eq!(stored.applied_config_status, ApplyStatus::Pending);
        assert_eq!(stored.apply_error, None);
    }

    #[test]
    fn test_apply_report_transitions() {
        let reg = registry();
        reg.register_or_update(&connected_agent("agent-1")).unwrap();
        reg.set_desired_config("agent-1", "cfg", "hash-1").unwrap();

        reg.update_apply("agent-1", "hash-1", ApplyStatus::Applied, None)
            .unwrap();
        let stored = reg.get("agent-1").unwrap().unwrap();
        assert_eq!(stored.applied_config_status, ApplyStatus::Applied);
        assert_eq!(stored.desired_config_hash.as_deref(), Some("hash-1"));

        reg.update_apply("agent-1", "hash-1", ApplyStatus::Failed, Some("bad exporter"))
            .unwrap();
        let stored = reg.get("agent-1").unwrap().unwrap();
        assert_eq!(stored.applied_config_status, ApplyStatus::Failed);
        assert_eq!(stored.apply_error.as_deref(), Some("bad exporter"));
        // A failed report never disturbs the desired hash.
        assert_eq!(stored.desired_config_hash.as_deref(), Some("hash-1"));
    }

    #[test]
    fn test_stale_applied_report_recorded_as_unknown() {
        let reg = registry();
        reg.register_or_update(&connected_agent("agent-1")).unwrap();
        reg.set_desired_config("agent-1", "cfg", "hash-2").unwrap();

        // Report for a hash that is no longer desired.
        reg.update_apply("agent-1", "hash-1", ApplyStatus::Applied, None)
            .unwrap();
        let stored = reg.get("agent-1").unwrap().unwrap();
        assert_eq!(stored.applied_config_status, ApplyStatus::Unknown);
        assert_eq!(stored.desired_config_hash.as_deref(), Some("hash-2"));
    }

    #[test]
    fn test_list_filters_and_ordering() {
        let reg = registry();
        for (uid, status) in [
            ("a", AgentStatus::Connected),
            ("b", AgentStatus::Disconnected),
            ("c", AgentStatus::Connected),
        ] {
            let mut agent = connected_agent(uid);
            agent.status = status;
            reg.register_or_update(&agent).unwrap();
        }

        let all = reg.list(&AgentFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        // Ordered by last_seen descending: later registrations first.
        assert!(all[0].last_seen >= all[2].last_seen);

        let connected = reg
            .list(&AgentFilter {
                status: Some(AgentStatus::Connected),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(connected.len(), 2);

        let labeled = reg
            .list(&AgentFilter {
                labels: BTreeMap::from([("role".to_string(), "daemonset".to_string())]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(labeled.len(), 3);

        let none = reg
            .list(&AgentFilter {
                labels: BTreeMap::from([("role".to_string(), "gateway".to_string())]),
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());

        let limited = reg
            .list(&AgentFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_delete_removes_and_reports_missing() {
        let reg = registry();
        reg.register_or_update(&connected_agent("agent-1")).unwrap();
        reg.delete("agent-1").unwrap();
        assert!(reg.get("agent-1").unwrap().is_none());
        assert!(matches!(
            reg.delete("agent-1"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_heartbeat_bumps_last_seen_and_tolerates_missing() {
        let reg = registry();
        reg.register_or_update(&connected_agent("agent-1")).unwrap();
        let before = reg.get("agent-1").unwrap().unwrap().last_seen;
        std::thread::sleep(Duration::from_millis(5));
        reg.record_heartbeat("agent-1").unwrap();
        let after = reg.get("agent-1").unwrap().unwrap().last_seen;
        assert!(after > before);

        // A heartbeat for a deleted agent is not an error.
        reg.record_heartbeat("ghost").unwrap();
    }

    #[test]
    fn test_list_stale_picks_old_connected_agents() {
        let reg = registry();
        reg.register_or_update(&connected_agent("fresh")).unwrap();
        let mut old = connected_agent("old");
        old.last_seen = Utc::now() - chrono::Duration::seconds(600);
        reg.register_or_update(&old).unwrap();
        let mut gone = connected_agent("gone");
        gone.status = AgentStatus::Disconnected;
        gone.last_seen = Utc::now() - chrono::Duration::seconds(600);
        reg.register_or_update(&gone).unwrap();

        let stale = reg.list_stale(Duration::from_secs(60)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].instance_uid, "old");
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let reg = Arc::new(registry());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        let counter_clone = Arc::clone(&counter);
        let id = reg.subscribe(Arc::new(move |event: RegistryEvent| {
            seen_clone
                .lock()
                .unwrap()
                .push((event.kind, event.agent.instance_uid.clone()));
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        reg.register_or_update(&connected_agent("agent-1")).unwrap();
        reg.set_desired_config("agent-1", "cfg", "h1").unwrap();
        reg.update_apply("agent-1", "h1", ApplyStatus::Failed, Some("boom"))
            .unwrap();
        reg.update_status("agent-1", AgentStatus::Disconnected)
            .unwrap();

        // Handlers run on detached tasks; wait for delivery.
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events = seen.lock().unwrap().clone();
        let kinds: Vec<RegistryEventKind> = events.iter().map(|(k, _)| *k).collect();
        assert!(kinds.contains(&RegistryEventKind::AgentConnected));
        assert!(kinds.contains(&RegistryEventKind::ConfigFailed));
        assert!(kinds.contains(&RegistryEventKind::AgentDisconnected));

        reg.unsubscribe(id);
        let before = counter.load(Ordering::SeqCst);
        reg.record_heartbeat("agent-1").unwrap();
        reg.update_status("agent-1", AgentStatus::Connected).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), before);
    }
}
