//! SSE bridge for the tool-log bus
//!
//! Attaches a bus subscription to an event-stream response: buffered
//! replay first, then live events, with a `: ping` heartbeat. A mock
//! variant serves synthesized frames for UI work and tests, gated to
//! development, an explicit env toggle, or loopback clients.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderName, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::stream::Stream;

use crate::config::Environment;
use crate::toollog::{EventFilter, Subscription};
use crate::types::{EventId, SessionId, ToolLogEvent, ToolStage, TraceId};

use super::server::AppState;
use super::types::{ErrorResponse, MockStreamQuery, SinceQuery, StreamQuery};

/// Instruct proxies not to buffer the stream.
const ACCEL_HEADER: HeaderName = HeaderName::from_static("x-accel-buffering");

fn filter_from(session_id: Option<String>, trace_id: Option<String>) -> EventFilter {
    EventFilter {
        session_id: session_id.map(SessionId),
        trace_id: trace_id.map(TraceId),
    }
}

fn event_stream(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize tool-log event: {e}");
            String::from("{}")
        });
        Some((
            Ok::<_, Infallible>(Event::default().data(data)),
            subscription,
        ))
    })
}

fn sse_response<S>(stream: S, ping: Duration) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(ping).text("ping"));
    (
        [
            (
                axum::http::header::CACHE_CONTROL,
                "no-cache, no-transform",
            ),
            (ACCEL_HEADER, "no"),
        ],
        sse,
    )
        .into_response()
}

/// `GET /api/tool-logs/stream`: replay up to `limit` buffered events,
/// then follow the live stream until the client disconnects.
pub async fn stream_tool_logs(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let filter = filter_from(query.session_id, query.trace_id);
    let subscription = state.bus.subscribe(filter, query.limit);
    sse_response(event_stream(subscription), state.config.bus.ping_interval)
}

/// `GET /api/tool-logs/since`: catch-up after a disconnect.
pub async fn tool_logs_since(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> Json<Vec<ToolLogEvent>> {
    let filter = filter_from(query.session_id, query.trace_id);
    Json(state.bus.since(query.seq, &filter, query.max))
}

/// `GET /api/tool-logs/mock-stream`: synthesized frames at a fixed rate.
pub async fn mock_stream(
    State(state): State<AppState>,
    Query(query): Query<MockStreamQuery>,
    request: Request,
) -> Response {
    let allowed = state.config.api.environment == Environment::Development
        || state.config.api.allow_mock_stream
        || super::middleware::is_loopback(&request);
    if !allowed {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("forbidden").with_detail("mock stream is disabled")),
        )
            .into_response();
    }

    let rate = Duration::from_millis(query.rate_ms.unwrap_or(500).clamp(50, 5_000));
    let ping = state.config.bus.ping_interval;

    let stream = futures::stream::unfold(0u64, move |seq| async move {
        tokio::time::sleep(rate).await;
        let stage = match seq % 3 {
            0 => ToolStage::Start,
            1 => ToolStage::Chunk,
            _ => ToolStage::End,
        };
        let event = ToolLogEvent {
            id: EventId::new(),
            seq: seq + 1,
            ts: Utc::now(),
            session_id: None,
            trace_id: Some(TraceId("mock:stream".to_string())),
            tool: "mock.diagnostics".to_string(),
            stage,
            text: Some(format!("synthesized frame {}", seq + 1)),
            ok: matches!(stage, ToolStage::End).then_some(true),
            duration_ms: None,
        };
        let data = serde_json::to_string(&event).unwrap_or_default();
        Some((Ok::<_, Infallible>(Event::default().data(data)), seq + 1))
    });

    sse_response(stream, ping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::toollog::{EventDraft, ToolLogBus};
    use std::sync::Arc;

    async fn collect_events(
        bus: &Arc<ToolLogBus>,
        filter: EventFilter,
        n: usize,
    ) -> Vec<ToolLogEvent> {
        let mut subscription = bus.subscribe(filter, None);
        let mut events = Vec::with_capacity(n);
        for _ in 0..n {
            match subscription.recv().await {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn stream_delivers_filtered_events_in_order() {
        let bus = Arc::new(ToolLogBus::new(BusConfig::default()));

        let collector = tokio::spawn({
            let bus = bus.clone();
            async move {
                collect_events(
                    &bus,
                    EventFilter::for_trace(TraceId("ask:42".into())),
                    5,
                )
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..5 {
            bus.publish(
                EventDraft::new("helix.ask.stream", ToolStage::Chunk)
                    .trace(TraceId("ask:42".into())),
            );
        }
        bus.publish(
            EventDraft::new("helix.ask.stream", ToolStage::Chunk)
                .trace(TraceId("ask:99".into())),
        );

        let events = tokio::time::timeout(Duration::from_secs(1), collector)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.len(), 5);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(events
            .iter()
            .all(|e| e.trace_id == Some(TraceId("ask:42".into()))));
    }
}
