pub mod error;
mod handlers;
mod web;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::path::PathBuf;
use std::sync::Arc;

use crate::hub::BroadcastHub;
use crate::supervisor::ProcessState;

use handlers::*;

pub use web::CLIENT_SCRIPT;

/// Mount point for the embedded browser assets.
pub const CLIENT_ASSET_PREFIX: &str = "/_tailwatch";

#[derive(Clone)]
pub struct AppState {
    pub hub: BroadcastHub,
    /// Cancelled when the server begins shutting down.
    pub shutdown: CancellationToken,
    /// Stylesheet name sent to every client in the `__CSS_FILE__` handshake.
    pub artifact_name: Arc<str>,
    /// Watcher lifecycle, when a watcher was started.
    pub watcher: Option<watch::Receiver<ProcessState>>,
}

impl AppState {
    pub fn new(hub: BroadcastHub, shutdown: CancellationToken, artifact_name: &str) -> Self {
        Self {
            hub,
            shutdown,
            artifact_name: Arc::from(artifact_name),
            watcher: None,
        }
    }

    pub fn with_watcher(mut self, watcher: watch::Receiver<ProcessState>) -> Self {
        self.watcher = Some(watcher);
        self
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a router without static files.
#[derive(Default)]
pub struct RouterConfig {
    /// Directory served for paths no route matches, normally the watcher's
    /// output directory.
    pub static_dir: Option<PathBuf>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let assets = Router::new().fallback(web::client_asset);

    let router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws))
        .route("/messages", post(publish_message))
        .with_state(state)
        .nest(CLIENT_ASSET_PREFIX, assets);

    let router = match config.static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::MockConnection;
    use crate::connection::ConnectionRegistry;
    use crate::message::types;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt; // for oneshot()

    fn create_test_state() -> (AppState, ConnectionRegistry) {
        let registry = ConnectionRegistry::new();
        let hub = BroadcastHub::new(registry.clone());
        let state = AppState::new(hub, CancellationToken::new(), "site.css");
        (state, registry)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint_without_watcher() {
        let (state, _registry) = create_test_state();
        let app = router(state, RouterConfig::default());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["x-content-type-options"],
            "nosniff"
        );
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["watcher"].is_null());
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_watcher_state() {
        let (state, _registry) = create_test_state();
        let (_tx, rx) = watch::channel(ProcessState::Stopped { code: 0 });
        let app = router(state.with_watcher(rx), RouterConfig::default());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["watcher"]["state"], "stopped");
        assert_eq!(json["watcher"]["code"], 0);
    }

    #[tokio::test]
    async fn test_publish_message_broadcasts() {
        let (state, registry) = create_test_state();
        let conn = MockConnection::new();
        registry.register(conn.clone());
        let app = router(state, RouterConfig::default());

        let response = app
            .oneshot(post_json(
                "/messages",
                serde_json::json!({"type": "custom", "message": "hello"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let frames = conn.frames();
        assert_eq!(frames.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "custom");
        assert_eq!(frame["message"], "hello");
    }

    #[tokio::test]
    async fn test_publish_message_rejects_empty_type() {
        let (state, registry) = create_test_state();
        let conn = MockConnection::new();
        registry.register(conn.clone());
        let app = router(state, RouterConfig::default());

        let response = app
            .oneshot(post_json(
                "/messages",
                serde_json::json!({"type": "  ", "message": "hello"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "invalid_request");
        assert!(conn.frames().is_empty());
    }

    #[tokio::test]
    async fn test_publish_message_rejected_during_shutdown() {
        let (state, _registry) = create_test_state();
        state.shutdown.cancel();
        let app = router(state, RouterConfig::default());

        let response = app
            .oneshot(post_json(
                "/messages",
                serde_json::json!({"type": types::OUTPUT, "message": "late"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_client_script_is_served() {
        let (state, _registry) = create_test_state();
        let app = router(state, RouterConfig::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("{CLIENT_ASSET_PREFIX}/{CLIENT_SCRIPT}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.contains("javascript"), "got {content_type}");
    }

    #[tokio::test]
    async fn test_unknown_asset_is_not_found() {
        let (state, _registry) = create_test_state();
        let app = router(state, RouterConfig::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("{CLIENT_ASSET_PREFIX}/missing.js"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_dir_serves_generated_stylesheet() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("site.css"), "body{color:red}").unwrap();
        let (state, _registry) = create_test_state();
        let app = router(
            state,
            RouterConfig {
                static_dir: Some(dir.path().to_path_buf()),
            },
        );

        let response = app
            .oneshot(Request::builder().uri("/site.css").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"body{color:red}");
    }
}
