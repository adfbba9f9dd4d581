//! HTTP API route handlers

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use chrono::Utc;

use crate::ask::AskRequest;
use crate::safety::AdapterRunRequest;
use crate::types::{
    AskError, AskMode, OwnerId, Session, SessionId, SessionSummary, StoreError, TraceId,
    TrainingTrace,
};

use super::server::AppState;
use super::types::{
    AskBody, AskResponse, CreateSessionBody, ErrorResponse, HealthResponse, SessionListQuery,
    StopBody, StopResponse, TraceExportQuery,
};

type RouteError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, reason: &str) -> RouteError {
    (status, Json(ErrorResponse::new(reason)))
}

fn ask_error(err: AskError) -> RouteError {
    let status = match &err {
        AskError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        AskError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        AskError::PlanFailed(_)
        | AskError::ExecuteFailed(_)
        | AskError::ContextOverflow(_)
        | AskError::GenerationFailed(_)
        | AskError::Aborted => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse::new(err.reason()).with_detail(err.to_string())),
    )
}

fn store_error(err: StoreError) -> RouteError {
    let status = match &err {
        StoreError::Forbidden => StatusCode::FORBIDDEN,
        StoreError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::HashMismatch { .. } => StatusCode::CONFLICT,
    };
    let mut body = ErrorResponse::new(err.reason());
    if let StoreError::HashMismatch { expected } = &err {
        body.expected_hash = Some(expected.clone());
    }
    (status, Json(body))
}

/// Resolve the caller's owner identity from the `x-owner-id` header.
fn owner_from(headers: &HeaderMap) -> Result<OwnerId, RouteError> {
    headers
        .get("x-owner-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| OwnerId(value.to_string()))
        .filter(OwnerId::is_valid)
        .ok_or_else(|| error(StatusCode::FORBIDDEN, "forbidden"))
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        bus: state.bus.stats(),
        queued_asks: state.orchestrator.queued(),
    })
}

/// `POST /api/agi/ask`
pub async fn ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AskBody>,
) -> Result<Json<AskResponse>, RouteError> {
    let mode = match body.mode.as_deref() {
        None => None,
        Some(raw) => Some(raw.parse::<AskMode>().map_err(|reason| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("invalid_request").with_detail(reason)),
            )
        })?),
    };

    let owner_id = headers
        .get("x-owner-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| OwnerId(value.to_string()))
        .filter(OwnerId::is_valid);

    let knowledge = body.all_knowledge();
    let request = AskRequest {
        question: body.question,
        owner_id,
        session_id: body.session_id.map(SessionId),
        trace_id: body.trace_id.map(TraceId),
        mode,
        max_tokens: body.max_tokens,
        use_knowledge: body.use_knowledge,
        use_search_fallback: body.use_search_fallback,
        debug: body.debug,
        bundle: body.resonance,
        collapse: body.resonance_selection,
        knowledge,
    };

    let reply = state.orchestrator.ask(request).await.map_err(ask_error)?;
    Ok(Json(AskResponse {
        text: reply.reply_text,
        envelope: reply.envelope,
        sources: reply.sources,
        trace_id: reply.trace_id,
        debug: reply.debug,
        streamed_fallback: reply.streamed_fallback,
    }))
}

/// `POST /api/agi/ask/stop`
pub async fn stop_ask(
    State(state): State<AppState>,
    Json(body): Json<StopBody>,
) -> Json<StopResponse> {
    let stopped = state.orchestrator.stop(&TraceId(body.trace_id));
    Json(StopResponse { stopped })
}

/// `POST /api/agi/adapter/run`
pub async fn adapter_run(
    State(state): State<AppState>,
    Json(request): Json<AdapterRunRequest>,
) -> Result<Json<crate::safety::AdapterRunOutcome>, RouteError> {
    if request.actions.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "invalid_request"));
    }

    // Forbidden actuation and malformed packs are both 400s; the stable
    // reason string distinguishes them for callers.
    match state.safety.run(&request) {
        Ok(outcome) => Ok(Json(outcome)),
        Err(err) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(err.reason()).with_detail(err.to_string())),
        )),
    }
}

/// `GET /api/chat/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<Vec<SessionSummary>>, RouteError> {
    let owner = owner_from(&headers)?;
    state
        .sessions
        .list(&owner, query.limit, query.offset, query.include_messages)
        .map(Json)
        .map_err(store_error)
}

/// `POST /api/chat/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<Session>), RouteError> {
    let owner = owner_from(&headers)?;
    let session_id = body.session_id.map(SessionId).unwrap_or_default();

    let mut session = Session::new(owner, session_id);
    session.context_id = body.context_id;
    session.persona_id = body.persona_id;
    state
        .sessions
        .upsert(session.clone())
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `GET /api/chat/sessions/:id`
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, RouteError> {
    let owner = owner_from(&headers)?;
    state
        .sessions
        .get(&owner, &SessionId(session_id))
        .map(Json)
        .map_err(store_error)
}

/// `DELETE /api/chat/sessions/:id`
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<StatusCode, RouteError> {
    let owner = owner_from(&headers)?;
    state
        .sessions
        .delete(&owner, &SessionId(session_id))
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(store_error)
}

/// `GET /api/training-trace/export`
pub async fn export_traces(
    State(state): State<AppState>,
    Query(query): Query<TraceExportQuery>,
) -> Result<Json<Vec<TrainingTrace>>, RouteError> {
    if !state.config.api.enable_trace_api {
        return Err(error(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(Json(state.traces.export_since(query.since, query.limit)))
}
