use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::{body::Body, http::Request, Router};
use serde_json::{json, Value};
use tower::ServiceExt;

use magi::concurrency::ConcurrencyController;
use magi::config::Config;
use magi::consensus::ConsensusEngine;
use magi::models::PersonaType;
use magi::providers::{ChatRequest, ChatResponse, LLMClient, Provider, Usage};
use magi::ProviderError;
use magi_server::session::EngineFactory;
use magi_server::AppState;

struct ApprovingProvider;

#[async_trait]
impl Provider for ApprovingProvider {
    fn name(&self) -> &str {
        "approving"
    }

    fn model(&self) -> &str {
        "approving-model"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let content = if request.user_prompt.contains("Voting phase") {
            "```json\n{\"vote\": \"APPROVE\", \"reason\": \"fine\"}\n```".to_string()
        } else {
            "A measured position.".to_string()
        };
        Ok(ChatResponse {
            content,
            usage: Usage::default(),
            model: "approving-model".to_string(),
        })
    }
}

fn scripted_factory() -> EngineFactory {
    Arc::new(|config: Config, emitter| {
        let controller = Arc::new(ConcurrencyController::default());
        let mut clients = BTreeMap::new();
        for persona in PersonaType::ALL {
            let resolved = config.resolve_llm(persona);
            clients.insert(
                persona,
                Arc::new(LLMClient::new(
                    Arc::new(ApprovingProvider),
                    &resolved,
                    config.max_output_tokens,
                    Arc::clone(&controller),
                )),
            );
        }
        Ok(ConsensusEngine::with_clients(
            config, controller, emitter, clients,
        ))
    })
}

fn test_app() -> Router {
    let config = Config {
        api_key: "test-key".into(),
        ..Default::default()
    };
    let state = AppState::with_engine_factory(config, scripted_factory());
    magi_server::routes::configure(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();
    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_session_returns_ws_url() {
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/sessions",
            json!({"prompt": "Should we ship feature X?"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    let session_id = body["session_id"].as_str().unwrap();
    assert!(!session_id.is_empty());
    assert_eq!(
        body["ws_url"],
        format!("/ws/sessions/{}", session_id)
    );
    assert_eq!(body["status"], "QUEUED");
}

#[tokio::test]
async fn test_empty_prompt_rejected() {
    let app = test_app();
    let response = app
        .oneshot(post_json("/api/sessions", json!({"prompt": ""})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("prompt"));
}

#[tokio::test]
async fn test_prompt_length_boundaries() {
    // Exactly at the limits: 1 and 8000 accepted; 8001 rejected.
    let app = test_app();
    let response = app
        .oneshot(post_json("/api/sessions", json!({"prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let app = test_app();
    let at_limit = "y".repeat(8000);
    let response = app
        .oneshot(post_json("/api/sessions", json!({"prompt": at_limit})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let app = test_app();
    let over_limit = "z".repeat(8001);
    let response = app
        .oneshot(post_json("/api/sessions", json!({"prompt": over_limit})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_unknown_session_is_404() {
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/sessions/does-not-exist/cancel",
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_then_recancel_reports_terminal_status() {
    let config = Config {
        api_key: "test-key".into(),
        ..Default::default()
    };
    let state = AppState::with_engine_factory(config, scripted_factory());
    let app = magi_server::routes::configure(state.clone());

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/sessions",
            json!({"prompt": "Should we ship feature X?"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let cancel_uri = format!("/api/sessions/{}/cancel", session_id);
    let response = app
        .clone()
        .oneshot(post_json(&cancel_uri, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first = body_json(response).await;
    assert!(matches!(
        first["status"].as_str().unwrap(),
        "CANCELLING" | "CANCELLED"
    ));

    // Wait for the session task to reach its terminal phase, then verify the
    // repeat cancel is a no-op returning the same status.
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if state
            .session_manager
            .get(&session_id)
            .await
            .map(|s| s.phase.is_terminal())
            .unwrap_or(false)
        {
            break;
        }
    }

    let response = app
        .clone()
        .oneshot(post_json(&cancel_uri, json!({})))
        .await
        .unwrap();
    let second = body_json(response).await;
    let response = app
        .oneshot(post_json(&cancel_uri, json!({})))
        .await
        .unwrap();
    let third = body_json(response).await;
    assert_eq!(second["status"], third["status"]);
}

#[tokio::test]
async fn test_get_session_snapshot() {
    let config = Config {
        api_key: "test-key".into(),
        ..Default::default()
    };
    let state = AppState::with_engine_factory(config, scripted_factory());
    let app = magi_server::routes::configure(state);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/sessions",
            json!({"prompt": "Should we ship feature X?"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/sessions/{}", session_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = body_json(response).await;
    assert_eq!(snapshot["session_id"], session_id.as_str());
    assert!(snapshot["units"].as_object().unwrap().len() == 3);
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/sessions",
            json!({"prompt": "ok", "options": {"max_rounds": 0}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
