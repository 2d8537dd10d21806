//! Admin API handlers.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use fleetd_core::model::{Agent, AgentFilter, ConfigSelector};

use super::{ApiError, AppState};

/// Valid instance UIDs in URL paths: 1-256 characters of `[a-zA-Z0-9._-]`.
static INSTANCE_UID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]{1,256}$").expect("uid pattern is valid"));

fn validate_uid(id: &str) -> Result<(), ApiError> {
    if INSTANCE_UID.is_match(id) {
        Ok(())
    } else {
        Err(ApiError::BadRequest("invalid agent id format".to_string()))
    }
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// `healthy` or `unhealthy`.
    pub status: String,
    /// When the probe ran.
    pub timestamp: DateTime<Utc>,
    /// Per-dependency results.
    pub checks: BTreeMap<String, String>,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    let mut checks = BTreeMap::new();

    match state.registry.list(&AgentFilter {
        limit: Some(1),
        ..Default::default()
    }) {
        Ok(_) => checks.insert("database".to_string(), "healthy".to_string()),
        Err(err) => checks.insert("database".to_string(), format!("unhealthy: {err}")),
    };

    if let Some(syncer) = &state.syncer {
        let value = match syncer.last_commit() {
            Some(commit) => format!("healthy (commit: {})", &commit[..commit.len().min(8)]),
            None => "pending".to_string(),
        };
        checks.insert("git_sync".to_string(), value);
    }

    let healthy = checks
        .values()
        .all(|v| v.starts_with("healthy") || v == "pending");
    let status = if healthy { "healthy" } else { "unhealthy" };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthStatus {
            status: status.to_string(),
            timestamp: Utc::now(),
            checks,
        }),
    )
        .into_response()
}

/// `GET /ready`
pub async fn ready(State(state): State<AppState>) -> Response {
    match state.registry.list(&AgentFilter {
        limit: Some(1),
        ..Default::default()
    }) {
        Ok(_) => (StatusCode::OK, "ready").into_response(),
        Err(err) => {
            warn!(error = %err, "readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
        }
    }
}

/// Query parameters for `GET /api/v1/agents`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Connection status filter.
    pub status: Option<String>,
    /// Apply status filter.
    pub config_status: Option<String>,
}

/// Response body for `GET /api/v1/agents`.
#[derive(Debug, Serialize)]
pub struct AgentList {
    /// Matching agent records.
    pub agents: Vec<Agent>,
    /// Number of records returned.
    pub count: usize,
}

/// `GET /api/v1/agents`
pub async fn list_agents(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<AgentList>, ApiError> {
    let mut filter = AgentFilter::default();
    if let Some(status) = &params.status {
        filter.status = Some(status.parse().map_err(ApiError::BadRequest)?);
    }
    if let Some(config_status) = &params.config_status {
        filter.apply_status = Some(config_status.parse().map_err(ApiError::BadRequest)?);
    }

    let agents = state.registry.list(&filter).map_err(|err| {
        error!(error = %err, "failed to list agents");
        ApiError::from(err)
    })?;
    let count = agents.len();
    Ok(Json(AgentList { agents, count }))
}

/// `GET /api/v1/agents/{id}`
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    validate_uid(&id)?;
    let agent = state
        .registry
        .get(&id)?
        .ok_or_else(|| ApiError::NotFound("agent not found".to_string()))?;
    Ok(Json(agent))
}

/// Response body for `GET /api/v1/agents/{id}/config`.
#[derive(Debug, Serialize)]
pub struct EffectiveConfigBody {
    /// Configuration name.
    pub name: String,
    /// Content fingerprint.
    pub fingerprint: String,
    /// The merged document.
    pub content: String,
    /// Selector that produced it; empty for the base fallback.
    pub source_selector_name: String,
}

/// `GET /api/v1/agents/{id}/config`
///
/// Returns JSON by default; a raw `text/yaml` body when the `Accept`
/// header asks for YAML.
pub async fn get_agent_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: header::HeaderMap,
) -> Result<Response, ApiError> {
    validate_uid(&id)?;
    let agent = state
        .registry
        .get(&id)?
        .ok_or_else(|| ApiError::NotFound("agent not found".to_string()))?;

    let config = state
        .resolver
        .resolve(&agent)
        .map_err(|err| {
            warn!(uid = %id, error = %err, "failed to resolve agent config");
            ApiError::Internal(err.to_string())
        })?
        .ok_or_else(|| ApiError::NotFound("no config available".to_string()))?;

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if accept == "text/yaml" || accept == "application/x-yaml" {
        return Ok((
            [(header::CONTENT_TYPE, "text/yaml")],
            config.content,
        )
            .into_response());
    }

    Ok(Json(EffectiveConfigBody {
        name: config.name,
        fingerprint: config.fingerprint,
        content: String::from_utf8_lossy(&config.content).into_owned(),
        source_selector_name: config.source_selector_name,
    })
    .into_response())
}

/// `DELETE /api/v1/agents/{id}`
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    validate_uid(&id)?;
    state.registry.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Response body for `POST /api/v1/sync`.
#[derive(Debug, Serialize)]
pub struct SyncOutcome {
    /// `synced` or `failed`.
    pub status: String,
    /// Commit hash after the sync.
    pub commit: String,
    /// Number of agents that received a new configuration.
    pub agents_notified: usize,
    /// Failure description, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /api/v1/sync`
pub async fn trigger_sync(State(state): State<AppState>) -> Response {
    let Some(syncer) = &state.syncer else {
        return ApiError::BadRequest("git sync is not configured".to_string()).into_response();
    };

    let commit = match syncer.sync_once().await {
        Ok(commit) => commit,
        Err(err) => {
            error!(error = %err, "manual sync failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SyncOutcome {
                    status: "failed".to_string(),
                    commit: String::new(),
                    agents_notified: 0,
                    error: Some(err.to_string()),
                }),
            )
                .into_response();
        }
    };

    if let Err(err) = state.resolver.reload(syncer.local_path()) {
        error!(error = %err, "failed to reload configs after manual sync");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SyncOutcome {
                status: "failed".to_string(),
                commit,
                agents_notified: 0,
                error: Some(err.to_string()),
            }),
        )
            .into_response();
    }

    let agents_notified = state.opamp.push_to_all().await;
    Json(SyncOutcome {
        status: "synced".to_string(),
        commit,
        agents_notified,
        error: None,
    })
    .into_response()
}

/// Response body for `GET /api/v1/selectors`.
#[derive(Debug, Serialize)]
pub struct SelectorList {
    /// The ordered selector sequence.
    pub selectors: Vec<ConfigSelector>,
    /// Number of selectors.
    pub count: usize,
}

/// `GET /api/v1/selectors`
pub async fn get_selectors(State(state): State<AppState>) -> Json<SelectorList> {
    let selectors = state.resolver.selectors();
    let count = selectors.len();
    Json(SelectorList { selectors, count })
}
