//! End-to-end tests over the assembled HTTP router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use helix_runtime::ask::{StaticExecutor, StaticLanguageModel, StaticPlanner, StaticSearch};
use helix_runtime::{Capabilities, GatewayConfig, GatewayRuntime, HttpApiServer, KnowledgeFile};

fn knowledge() -> Vec<KnowledgeFile> {
    vec![KnowledgeFile {
        id: "warp".into(),
        project_id: "p".into(),
        path: "modules/warp/warp-module.ts".into(),
        name: "warp-module.ts".into(),
        preview: "warp shell evolution".into(),
        mime: "text/plain".into(),
        size: 20,
    }]
}

fn runtime_with(config: GatewayConfig) -> GatewayRuntime {
    GatewayRuntime::new(
        config,
        Capabilities {
            planner: Arc::new(StaticPlanner),
            executor: Arc::new(StaticExecutor),
            search: Arc::new(StaticSearch { corpus: knowledge() }),
            model: Arc::new(StaticLanguageModel {
                reply: "The shell integrates outward.".into(),
            }),
        },
    )
    .expect("runtime builds")
}

fn router(runtime: &GatewayRuntime) -> axum::Router {
    HttpApiServer::new(runtime.app_state()).router()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", "10.0.0.9")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

#[tokio::test]
async fn rate_limit_window_returns_429_with_retry_hints() {
    let mut config = GatewayConfig::default();
    config.rate_limit.window_ms = 60_000;
    config.rate_limit.api_max = 2;
    let runtime = runtime_with(config);
    let app = router(&runtime);

    let request = |_: u32| {
        Request::builder()
            .method("GET")
            .uri("/api/chat/sessions")
            .header("x-owner-id", "alice")
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .expect("request builds")
    };

    let first = app.clone().oneshot(request(1)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first.headers().get("ratelimit-remaining").unwrap(),
        "1"
    );

    let second = app.clone().oneshot(request(2)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let third = app.clone().oneshot(request(3)).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = third
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((59..=60).contains(&retry_after));

    let body = body_json(third).await;
    assert_eq!(body["error"], "rate_limited");
    let retry_ms = body["retryAfterMs"].as_u64().unwrap();
    assert!(retry_ms > 59_000 && retry_ms <= 60_000);
}

#[tokio::test]
async fn ask_returns_text_sources_and_trace() {
    let runtime = runtime_with(GatewayConfig::default());
    let app = router(&runtime);

    let response = app
        .oneshot(post_json(
            "/api/agi/ask",
            json!({"question": "how does the warp bubble solver work?"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["text"], "The shell integrates outward.");
    assert!(body["traceId"].as_str().unwrap().starts_with("ask:"));
    let sources: Vec<String> = body["sources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap().to_string())
        .collect();
    assert!(sources.contains(&"search: modules/warp/warp-module.ts".to_string()));
}

#[tokio::test]
async fn empty_question_is_rejected() {
    let runtime = runtime_with(GatewayConfig::default());
    let app = router(&runtime);

    let response = app
        .oneshot(post_json("/api/agi/ask", json!({"question": "  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn forbidden_actuation_is_rejected_without_a_trace_row() {
    let runtime = runtime_with(GatewayConfig::default());
    let app = router(&runtime);

    let response = app
        .oneshot(post_json(
            "/api/agi/adapter/run",
            json!({
                "actions": [{"id": "a", "kind": "motor.spin", "params": {"torque": 1.0}}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"],
        "controller-boundary-violation"
    );
    assert_eq!(runtime.traces.len(), 0);
}

#[tokio::test]
async fn robotics_veto_fails_the_run_and_appends_a_trace() {
    let runtime = runtime_with(GatewayConfig::default());
    let app = router(&runtime);

    let response = app
        .oneshot(post_json(
            "/api/agi/adapter/run",
            json!({
                "actions": [{"id": "a", "kind": "plan.move", "params": {}}],
                "roboticsSafety": {
                    "collisionMargin": 0.01,
                    "collisionMarginMin": 0.05,
                    "torqueUsage": 0.7,
                    "torqueUsageMax": 0.8,
                    "speedUsage": 0.6,
                    "speedUsageMax": 0.9,
                    "stabilityMargin": 0.4,
                    "stabilityMarginMin": 0.3
                }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["verdict"], "FAIL");
    assert_eq!(body["pass"], false);
    assert_eq!(body["firstFail"]["id"], "ROBOTICS_SAFETY_COLLISION_MARGIN");
    assert_eq!(body["certificate"]["status"], "RED");

    let rows = runtime.traces.export_since(0, 10);
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].pass);
}

#[tokio::test]
async fn session_crud_is_owner_scoped() {
    let runtime = runtime_with(GatewayConfig::default());
    let app = router(&runtime);

    // Create without an owner header is forbidden.
    let response = app
        .clone()
        .oneshot(post_json("/api/chat/sessions", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Create, read back, delete.
    let create = Request::builder()
        .method("POST")
        .uri("/api/chat/sessions")
        .header("content-type", "application/json")
        .header("x-owner-id", "alice")
        .body(Body::from(json!({"sessionId": "s1"}).to_string()))
        .unwrap();
    let response = app.clone().oneshot(create).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let get = Request::builder()
        .uri("/api/chat/sessions/s1")
        .header("x-owner-id", "alice")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["sessionId"], "s1");

    // Another owner cannot see it.
    let other = Request::builder()
        .uri("/api/chat/sessions/s1")
        .header("x-owner-id", "mallory")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(other).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/chat/sessions/s1")
        .header("x-owner-id", "alice")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn trace_export_is_gated() {
    let runtime = runtime_with(GatewayConfig::default());
    let app = router(&runtime);

    let request = Request::builder()
        .uri("/api/training-trace/export?since=0&limit=10")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let mut config = GatewayConfig::default();
    config.api.enable_trace_api = true;
    let runtime = runtime_with(config);
    let app = router(&runtime);

    let request = Request::builder()
        .uri("/api/training-trace/export?since=0&limit=10")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_reports_bus_and_queue() {
    let runtime = runtime_with(GatewayConfig::default());
    let app = router(&runtime);

    let request = Request::builder()
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert!(body["bus"]["published"].is_number());
    assert_eq!(body["queuedAsks"], 0);
}
