//! Git webhook endpoint.
//!
//! `POST /webhook/git`, mounted only when a webhook secret is configured.
//! Requests carry an HMAC-SHA256 signature in `X-Hub-Signature-256`;
//! verification is constant-time and happens before the payload is parsed.
//! Validated push events run a synchronous sync; the commit-transition
//! callback handles store reload and fan-out.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::{ApiError, AppState};

/// Header carrying the HMAC-SHA256 signature.
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// GitHub event type header.
const GITHUB_EVENT_HEADER: &str = "x-github-event";

/// GitLab event type header.
const GITLAB_EVENT_HEADER: &str = "x-gitlab-event";

type HmacSha256 = Hmac<Sha256>;

/// Relevant fields of a push event payload.
#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(default, rename = "ref")]
    git_ref: String,
    #[serde(default)]
    after: String,
    #[serde(default)]
    repository: Repository,
    #[serde(default)]
    pusher: Pusher,
}

#[derive(Debug, Default, Deserialize)]
struct Repository {
    #[serde(default)]
    full_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Pusher {
    #[serde(default)]
    name: String,
}

/// `POST /webhook/git`
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(secret) = &state.webhook_secret else {
        // Route is only mounted when a secret is configured.
        return Err(ApiError::NotFound("webhook not configured".to_string()));
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing signature".to_string()))?;
    if !verify_signature(secret, &body, signature) {
        warn!("webhook signature verification failed");
        return Err(ApiError::Unauthorized("invalid signature".to_string()));
    }

    let event = headers
        .get(GITHUB_EVENT_HEADER)
        .or_else(|| headers.get(GITLAB_EVENT_HEADER))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match event {
        "push" | "Push Hook" => {
            let payload: PushPayload = serde_json::from_slice(&body)
                .map_err(|err| ApiError::BadRequest(format!("invalid push payload: {err}")))?;
            info!(
                repo = %payload.repository.full_name,
                git_ref = %payload.git_ref,
                commit = %payload.after,
                pusher = %payload.pusher.name,
                "processing push event"
            );

            let Some(syncer) = &state.syncer else {
                return Err(ApiError::BadRequest("git sync is not configured".to_string()));
            };
            let commit = syncer.sync_once().await.map_err(|err| {
                warn!(error = %err, "webhook-triggered sync failed");
                ApiError::Internal(err.to_string())
            })?;
            info!(commit = %commit, "webhook sync completed");
        }
        "ping" => info!("received webhook ping"),
        other => debug!(event = other, "ignoring webhook event"),
    }

    Ok(Json(json!({ "status": "ok" })))
}

/// Verifies `sha256=<hex>` against the body with a constant-time compare.
fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;

    use fleetd_core::registry::Registry;
    use fleetd_core::registry::sqlite::SqliteRegistry;
    use fleetd_core::resolve::Resolver;
    use fleetd_core::store::ConfigStore;

    use crate::opamp::OpampServer;

    use super::*;

    const SECRET: &str = "webhook-test-secret";

    fn state() -> AppState {
        let registry: Arc<dyn Registry> = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let resolver = Arc::new(Resolver::new(Arc::new(ConfigStore::new()), None));
        let opamp = OpampServer::new(Arc::clone(&registry), Arc::clone(&resolver));
        AppState {
            registry,
            resolver,
            syncer: None,
            opamp,
            webhook_secret: Some(SECRET.to_string()),
        }
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn headers(signature: Option<&str>, event: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(sig) = signature {
            headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());
        }
        if let Some(event) = event {
            headers.insert(GITHUB_EVENT_HEADER, event.parse().unwrap());
        }
        headers
    }

    #[tokio::test]
    async fn test_missing_signature_is_unauthorized() {
        let result = handle(
            State(state()),
            headers(None, Some("push")),
            Bytes::from_static(b"{}"),
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_unauthorized() {
        let body = b"{}".to_vec();
        let bad = sign("some-other-secret", &body);
        let err = handle(
            State(state()),
            headers(Some(&bad), Some("push")),
            Bytes::from(body),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_signature_is_unauthorized() {
        let err = handle(
            State(state()),
            headers(Some("not-a-signature"), Some("push")),
            Bytes::from_static(b"{}"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ping_event_acknowledged() {
        let body = b"{}".to_vec();
        let sig = sign(SECRET, &body);
        let Json(response) = handle(
            State(state()),
            headers(Some(&sig), Some("ping")),
            Bytes::from(body),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_event_ignored_with_ok() {
        let body = b"{}".to_vec();
        let sig = sign(SECRET, &body);
        let Json(response) = handle(
            State(state()),
            headers(Some(&sig), Some("issues")),
            Bytes::from(body),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "ok");
    }

    #[tokio::test]
    async fn test_push_with_bad_payload_is_bad_request() {
        let body = b"not json".to_vec();
        let sig = sign(SECRET, &body);
        let err = handle(
            State(state()),
            headers(Some(&sig), Some("push")),
            Bytes::from(body),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_without_syncer_is_bad_request() {
        let body = br#"{"ref": "refs/heads/main", "after": "abc"}"#.to_vec();
        let sig = sign(SECRET, &body);
        let err = handle(
            State(state()),
            headers(Some(&sig), Some("push")),
            Bytes::from(body),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_verify_signature_round_trip() {
        let body = b"payload bytes";
        let sig = sign(SECRET, body);
        assert!(verify_signature(SECRET, body, &sig));
        assert!(!verify_signature(SECRET, b"other bytes", &sig));
        assert!(!verify_signature("wrong", body, &sig));
    }
}
