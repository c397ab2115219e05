//! HTTP surface smoke tests: auth boundary, error envelope, and a full
//! request/response pass through the router.

mod support;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::util::ServiceExt;

use ragloom::api::AuthVerifier;

use support::harness;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_is_unauthenticated() {
    let h = harness().await;
    let app = ragloom::api::router(h.state.clone());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn missing_or_invalid_tokens_get_401_with_detail_envelope() {
    let h = harness().await;
    let app = ragloom::api::router(h.state.clone());

    let response = app
        .clone()
        .oneshot(Request::get("/api/v1/documents").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert!(body["detail"].is_string());

    let response = app
        .oneshot(
            Request::get("/api/v1/documents")
                .header(header::AUTHORIZATION, "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authenticated_listing_and_not_found_mapping() {
    let h = harness().await;
    let app = ragloom::api::router(h.state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v1/documents")
                .header(header::AUTHORIZATION, "Bearer test-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["documents"].as_array().unwrap().is_empty());

    // Unknown entities map to 404 with the same envelope.
    let response = app
        .oneshot(
            Request::get(format!(
                "/api/v1/documents/{}",
                uuid::Uuid::new_v4()
            ))
            .header(header::AUTHORIZATION, "Bearer test-token")
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "document not found");
}

#[tokio::test]
async fn settings_require_an_admin_role() {
    let h = harness().await;
    // Register a plain-user token alongside the admin one.
    h.state.auth.verify("test-token").await.expect("seeded token");
    let verifier = ragloom::api::StaticTokenVerifier::new();
    verifier.insert(
        "user-token",
        ragloom::api::Principal {
            tenant_id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            role: ragloom::tenant::UserRole::User,
        },
    );
    let state = ragloom::api::AppState {
        auth: std::sync::Arc::new(verifier),
        ..h.state.clone()
    };
    let app = ragloom::api::router(state);

    let response = app
        .oneshot(
            Request::put("/api/v1/settings/llm-provider")
                .header(header::AUTHORIZATION, "Bearer user-token")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({ "provider": "ollama", "model": "llama3" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
