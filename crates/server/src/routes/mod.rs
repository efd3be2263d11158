use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod dispatch;
mod health;
mod sessions;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Device sessions
        .route("/sessions/:owner", get(sessions::list_sessions))
        .route(
            "/sessions/:owner/:device",
            post(sessions::start_session)
                .get(sessions::session_status)
                .delete(sessions::destroy_session),
        )
        // Messaging
        .route("/dispatch", post(dispatch::enqueue))
        .route("/quota/:owner", get(dispatch::check_quota))
        .route("/messages/:owner", get(dispatch::list_messages))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::quota::MemoryQuotaCache;
    use crate::state::Collaborators;
    use crate::store::SubscriptionStore;
    use crate::testing::{fast_session_config, limited_plan, FakeConnector, MemoryStore};

    struct TestApp {
        router: Router,
        state: AppState,
        store: Arc<MemoryStore>,
        _uploads: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let uploads = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let mut config = Config::default();
        config.session = fast_session_config();
        config.storage.attachments_dir = uploads.path().display().to_string();

        let (state, worker) = AppState::new(
            config,
            Collaborators {
                devices: store.clone(),
                subscriptions: store.clone(),
                logs: store.clone(),
                credentials: store.clone(),
                cache: Arc::new(MemoryQuotaCache::new()),
                connector: Arc::new(FakeConnector::new()),
            },
        );
        state.dispatcher.spawn_worker(worker);

        TestApp {
            router: create_router(state.clone()),
            state,
            store,
            _uploads: uploads,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, body) = call(&app.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_quota_without_subscription_reports_reason() {
        let app = test_app();
        let (status, body) = call(&app.router, "GET", "/quota/owner-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], false);
        assert_eq!(body["reason"], "No active subscription");
    }

    #[tokio::test]
    async fn test_dispatch_rejections_map_to_status_codes() {
        let app = test_app();

        let invalid = json!({
            "owner_id": "owner-1",
            "device_id": "phone",
            "kind": "bulk",
            "recipients": [],
            "body": "hi",
        });
        let (status, body) = call(&app.router, "POST", "/dispatch", Some(invalid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let unsubscribed = json!({
            "owner_id": "owner-1",
            "device_id": "phone",
            "kind": "single",
            "recipients": ["15550001111"],
            "body": "hi",
        });
        let (status, body) = call(&app.router, "POST", "/dispatch", Some(unsubscribed)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "No active subscription");
    }

    #[tokio::test]
    async fn test_accepted_dispatch_returns_job_id() {
        let app = test_app();
        let plan = limited_plan(10, 1, 30);
        app.store.save_plan(&plan).await.unwrap();
        app.state.quota.assign_plan("owner-1", plan.id).await.unwrap();

        let request = json!({
            "owner_id": "owner-1",
            "device_id": "phone",
            "kind": "single",
            "recipients": ["15550001111"],
            "body": "hi",
        });
        let (status, body) = call(&app.router, "POST", "/dispatch", Some(request)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["job_id"].as_str().is_some_and(|id| id.parse::<uuid::Uuid>().is_ok()));
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let app = test_app();
        let plan = limited_plan(10, 1, 30);
        app.store.save_plan(&plan).await.unwrap();
        app.state.quota.assign_plan("owner-1", plan.id).await.unwrap();

        let (status, body) = call(&app.router, "POST", "/sessions/owner-1/phone", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["already_connected"], false);
        assert!(body["qr_image"]
            .as_str()
            .is_some_and(|qr| qr.starts_with("data:image/svg+xml;base64,")));

        let (status, body) = call(&app.router, "GET", "/sessions/owner-1/phone", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "awaiting_scan");

        let (_, body) = call(&app.router, "GET", "/sessions/owner-1", None).await;
        assert_eq!(body["live"], json!(["phone"]));

        let (status, _) = call(&app.router, "DELETE", "/sessions/owner-1/phone", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&app.router, "GET", "/sessions/owner-1/phone", None).await;
        assert_eq!(body["state"], "unstarted");
    }

    #[tokio::test]
    async fn test_device_limit_blocks_second_device() {
        let app = test_app();
        let plan = limited_plan(10, 1, 30);
        app.store.save_plan(&plan).await.unwrap();
        app.state.quota.assign_plan("owner-1", plan.id).await.unwrap();
        app.state.quota.register_device("owner-1", "phone").await.unwrap();

        let (status, body) = call(&app.router, "POST", "/sessions/owner-1/tablet", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Device limit reached");
    }
}
