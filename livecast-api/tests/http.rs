use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use livecast_api::{create_router, AppState};
use livecast_sfu::{LoopbackEngine, MemoryMessageStore, RoomRegistry, SfuConfig, WorkerPool, WorkerSettings};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

async fn state() -> AppState {
    let engine = LoopbackEngine::new();
    let pool = WorkerPool::start(&engine, 1, &WorkerSettings::default())
        .await
        .unwrap();
    let registry = RoomRegistry::new(SfuConfig::default(), Arc::new(pool), Arc::new(MemoryMessageStore::new()));
    AppState::new(registry)
}

#[tokio::test]
async fn test_health_on_root_and_health_path() {
    let app = create_router(state().await);

    for path in ["/", "/health"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(path)
                    .header(header::ORIGIN, "https://viewer.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["rooms"], 0);
        assert_eq!(json["peers"], 0);
    }
}

#[tokio::test]
async fn test_signaling_path_requires_upgrade() {
    let app = create_router(state().await);
    let response = app
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}
