//! HTTP API server
//!
//! Builds the Axum router over the shared runtime state and serves it.
//! Feature gates, CORS, rate limiting, and the concurrency guard are all
//! wired here from configuration.

use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, HeaderValue, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ask::AskOrchestrator;
use crate::config::GatewayConfig;
use crate::safety::SafetyGate;
use crate::store::{SessionStore, TraceStore};
use crate::toollog::ToolLogBus;
use crate::types::GatewayError;

use super::middleware::{
    auth_middleware, concurrency_middleware, logging_middleware, rate_limit_middleware,
    security_headers_middleware, ConcurrencyGuard, RateLimiter,
};
use super::routes;
use super::sse;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub bus: Arc<ToolLogBus>,
    pub sessions: Arc<SessionStore>,
    pub traces: Arc<TraceStore>,
    pub orchestrator: Arc<AskOrchestrator>,
    pub safety: Arc<SafetyGate>,
    pub started_at: Instant,
}

/// The gateway's HTTP server.
pub struct HttpApiServer {
    state: AppState,
}

impl HttpApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Bind and serve until the process exits.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let config = &self.state.config.api;
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Internal(format!("Failed to bind to {addr}: {e}")))?;

        if config.enable_agi_auth && std::env::var("HELIX_API_TOKEN").is_err() {
            tracing::error!(
                "ENABLE_AGI_AUTH is on but HELIX_API_TOKEN is unset — \
                 AGI routes will reject every request."
            );
        }

        tracing::info!("Helix gateway listening on {addr}");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {e}")))
    }

    /// Assemble the router with all routes and middleware layers.
    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let config = &state.config;

        let mut router = Router::new()
            .route("/api/health", get(routes::health))
            .with_state(state.clone());

        if config.api.enable_agi {
            let ask_guard = ConcurrencyGuard::new(config.ask.concurrency_max);
            let mut agi_router = Router::new()
                .route("/api/agi/ask", post(routes::ask))
                .route("/api/agi/ask/stop", post(routes::stop_ask))
                .route("/api/agi/adapter/run", post(routes::adapter_run))
                .layer(middleware::from_fn_with_state(
                    ask_guard,
                    concurrency_middleware,
                ));
            if config.api.enable_agi_auth {
                agi_router = agi_router.layer(middleware::from_fn(auth_middleware));
            }
            router = router.merge(agi_router.with_state(state.clone()));
        }

        let stream_router = Router::new()
            .route("/api/tool-logs/stream", get(sse::stream_tool_logs))
            .route("/api/tool-logs/mock-stream", get(sse::mock_stream))
            .with_state(state.clone());
        router = router.merge(stream_router);

        // The catch-up poller gets the larger ask-jobs budget instead of
        // the general API budget.
        let jobs_limiter = RateLimiter::new(
            crate::config::RateLimitConfig {
                api_max: config.rate_limit.ask_jobs_max,
                ..config.rate_limit.clone()
            },
            vec![],
        );
        let since_router = Router::new()
            .route("/api/tool-logs/since", get(sse::tool_logs_since))
            .layer(middleware::from_fn_with_state(
                jobs_limiter,
                rate_limit_middleware,
            ))
            .with_state(state.clone());
        router = router.merge(since_router);

        let session_router = Router::new()
            .route(
                "/api/chat/sessions",
                get(routes::list_sessions).post(routes::create_session),
            )
            .route(
                "/api/chat/sessions/:id",
                get(routes::get_session).delete(routes::delete_session),
            )
            .with_state(state.clone());
        router = router.merge(session_router);

        let trace_router = Router::new()
            .route("/api/training-trace/export", get(routes::export_traces))
            .with_state(state.clone());
        router = router.merge(trace_router);

        // Rate limiting skips the event-stream, health, and catch-up paths
        // (the latter carries its own budget above).
        let limiter = RateLimiter::new(
            config.rate_limit.clone(),
            vec![
                "/api/tool-logs".to_string(),
                "/api/health".to_string(),
            ],
        );
        router = router.layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));

        if !config.api.cors_origins.is_empty() {
            let allowed: Vec<HeaderValue> = config
                .api
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            let cors = CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
                .allow_credentials(false);
            router = router.layer(cors);
        }

        router
            .layer(middleware::from_fn(security_headers_middleware))
            .layer(middleware::from_fn(logging_middleware))
            .layer(TraceLayer::new_for_http())
    }
}
