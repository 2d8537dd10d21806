//! Admin HTTP surface.
//!
//! Health probes, the agent inspection API, manual sync, and the Git
//! webhook. Paths and semantics are stable for external administrators;
//! handlers only marshal registry and resolver state.

pub mod error;
pub mod handlers;
pub mod webhook;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use fleetd_core::gitsync::GitSyncer;
use fleetd_core::registry::Registry;
use fleetd_core::resolve::Resolver;

use crate::opamp::OpampServer;

pub use error::ApiError;

/// Shared state for all admin handlers.
#[derive(Clone)]
pub struct AppState {
    /// The agent registry.
    pub registry: Arc<dyn Registry>,
    /// The configuration resolver.
    pub resolver: Arc<Resolver>,
    /// The Git syncer; absent when no remote is configured.
    pub syncer: Option<GitSyncer>,
    /// The session layer, for fan-out after a manual sync.
    pub opamp: Arc<OpampServer>,
    /// Webhook HMAC secret; enables `POST /webhook/git` when set.
    pub webhook_secret: Option<String>,
}

/// Builds the admin router. The webhook route is mounted only when a
/// secret is configured.
#[must_use]
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/api/v1/agents", get(handlers::list_agents))
        .route(
            "/api/v1/agents/{id}",
            get(handlers::get_agent).delete(handlers::delete_agent),
        )
        .route("/api/v1/agents/{id}/config", get(handlers::get_agent_config))
        .route("/api/v1/selectors", get(handlers::get_selectors))
        .route("/api/v1/sync", post(handlers::trigger_sync));

    if state.webhook_secret.is_some() {
        router = router.route("/webhook/git", post(webhook::handle));
    }

    router.with_state(state)
}
