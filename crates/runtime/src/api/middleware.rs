//! HTTP middleware
//!
//! The request-path guards: sliding-window rate limiting, per-route
//! concurrency limits, bearer auth, security headers, and structured
//! request logging. The limiter and the guard never fail a request on
//! their own internal errors; they degrade open and log.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use subtle::ConstantTimeEq;

use crate::config::RateLimitConfig;

use super::types::ErrorResponse;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    reset_at: Instant,
}

/// Outcome of one limiter check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_secs: u64,
    },
    Limited {
        retry_after_ms: u64,
    },
}

/// Sliding-window rate limiter keyed by client address.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<DashMap<String, WindowEntry>>,
    sweep_armed: Arc<AtomicBool>,
    /// Path prefixes that bypass the limiter.
    skip_prefixes: Arc<Vec<String>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, skip_prefixes: Vec<String>) -> Self {
        Self {
            config,
            windows: Arc::new(DashMap::new()),
            sweep_armed: Arc::new(AtomicBool::new(false)),
            skip_prefixes: Arc::new(skip_prefixes),
        }
    }

    /// `max == 0` disables the limiter entirely.
    pub fn enabled(&self) -> bool {
        self.config.enabled && self.config.api_max > 0
    }

    /// Count one request against `key` at time `now`.
    pub fn check(&self, key: &str, now: Instant) -> LimitDecision {
        let window = self.config.effective_window();
        let max = self.config.api_max;

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(WindowEntry {
                count: 0,
                reset_at: now + window,
            });
        if entry.reset_at <= now {
            entry.count = 0;
            entry.reset_at = now + window;
        }
        entry.count += 1;

        let decision = if entry.count <= max {
            LimitDecision::Allowed {
                limit: max,
                remaining: max - entry.count,
                reset_secs: entry.reset_at.saturating_duration_since(now).as_secs(),
            }
        } else {
            LimitDecision::Limited {
                retry_after_ms: entry
                    .reset_at
                    .saturating_duration_since(now)
                    .as_millis() as u64,
            }
        };
        drop(entry);

        self.arm_sweep();
        decision
    }

    /// Start the purge loop if it is not already running. The loop exits
    /// (and disarms itself) once the key table is empty, so an idle
    /// process carries no timer.
    fn arm_sweep(&self) {
        if self
            .sweep_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let windows = self.windows.clone();
        let armed = self.sweep_armed.clone();
        let window = self.config.effective_window();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                let now = Instant::now();
                windows.retain(|_, entry| entry.reset_at > now);
                if windows.is_empty() {
                    armed.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });
    }

    fn should_skip(&self, request: &Request) -> bool {
        if request.method() == axum::http::Method::OPTIONS {
            return true;
        }
        if let Some(accept) = request.headers().get(header::ACCEPT) {
            if accept
                .to_str()
                .map(|v| v.contains("text/event-stream"))
                .unwrap_or(false)
            {
                return true;
            }
        }
        let path = request.uri().path();
        self.skip_prefixes.iter().any(|prefix| path.starts_with(prefix))
    }

    pub fn live_keys(&self) -> usize {
        self.windows.len()
    }
}

/// Extract the limiter key: rightmost forwarded-for entry, then
/// `x-real-ip`, then the peer address.
fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            // The rightmost entry is the one appended by our own proxy;
            // earlier entries are client-controlled.
            if let Some(last) = value.split(',').next_back() {
                let candidate = last.trim();
                if candidate.parse::<IpAddr>().is_ok() {
                    return candidate.to_string();
                }
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if value.trim().parse::<IpAddr>().is_ok() {
                return value.trim().to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Sliding-window rate limit middleware.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    if !limiter.enabled() || limiter.should_skip(&request) {
        return next.run(request).await;
    }

    let key = client_key(&request);
    let decision = limiter.check(&key, Instant::now());

    match decision {
        LimitDecision::Allowed {
            limit,
            remaining,
            reset_secs,
        } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("ratelimit-limit", value);
            }
            if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                headers.insert("ratelimit-remaining", value);
            }
            if let Ok(value) = HeaderValue::from_str(&reset_secs.to_string()) {
                headers.insert("ratelimit-reset", value);
            }
            response
        }
        LimitDecision::Limited { retry_after_ms } => {
            tracing::warn!(%key, "Rate limit exceeded");
            let retry_after_secs = retry_after_ms.div_ceil(1_000);
            let body = ErrorResponse {
                error: "rate_limited".to_string(),
                detail: None,
                retry_after_ms: Some(retry_after_ms),
                expected_hash: None,
            };
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Per-route integer semaphore.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    permits: Arc<tokio::sync::Semaphore>,
    max: usize,
}

impl ConcurrencyGuard {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(max)),
            max,
        }
    }

    /// Requests currently holding a permit. Derived from the semaphore so
    /// the count stays exact even when a request future is dropped
    /// mid-flight.
    pub fn in_flight(&self) -> usize {
        self.max.saturating_sub(self.permits.available_permits())
    }
}

/// Bounded-concurrency middleware. The permit is held across the whole
/// request and released on every path, including client aborts.
pub async fn concurrency_middleware(
    State(guard): State<ConcurrencyGuard>,
    request: Request,
    next: Next,
) -> Response {
    let Ok(_permit) = guard.permits.clone().try_acquire_owned() else {
        let in_flight = guard.in_flight();
        tracing::warn!(in_flight, "Route concurrency exhausted");
        let body = ErrorResponse::new("concurrency_exhausted")
            .with_detail(format!("{in_flight} request(s) in flight"));
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    };

    next.run(request).await
}

/// Bearer-token authentication, gated by `ENABLE_AGI_AUTH`.
///
/// Token comparison is constant-time to avoid timing leaks.
pub async fn auth_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let Ok(expected) = std::env::var("HELIX_API_TOKEN") else {
        tracing::error!("HELIX_API_TOKEN is not set while auth is enabled");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match token {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!("Authentication failed: missing or invalid bearer token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Security headers on every response.
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
    );
    response
}

/// Structured request logging with latency.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client = client_key(&request);

    let started = Instant::now();
    let response = next.run(request).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        method = %method,
        uri = %uri,
        client = %client,
        status = response.status().as_u16(),
        latency_ms,
        "Request completed"
    );
    response
}

/// Is the peer a loopback client? Used by the mock-stream policy gate.
pub fn is_loopback(request: &Request) -> bool {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(window_ms: u64, max: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                window_ms,
                api_max: max,
                ask_jobs_max: max,
            },
            vec![],
        )
    }

    #[tokio::test]
    async fn third_request_in_window_is_limited() {
        let limiter = limiter(60_000, 2);
        let now = Instant::now();

        match limiter.check("1.2.3.4", now) {
            LimitDecision::Allowed { remaining, .. } => assert_eq!(remaining, 1),
            other => panic!("unexpected {other:?}"),
        }
        match limiter.check("1.2.3.4", now + Duration::from_millis(5)) {
            LimitDecision::Allowed { remaining, .. } => assert_eq!(remaining, 0),
            other => panic!("unexpected {other:?}"),
        }
        match limiter.check("1.2.3.4", now + Duration::from_millis(10)) {
            LimitDecision::Limited { retry_after_ms } => {
                assert!(retry_after_ms > 59_000 && retry_after_ms <= 60_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn limited_count_matches_overflow_exactly() {
        let limiter = limiter(60_000, 5);
        let now = Instant::now();
        let total = 13u32;

        let limited = (0..total)
            .filter(|_| matches!(limiter.check("k", now), LimitDecision::Limited { .. }))
            .count() as u32;
        assert_eq!(limited, total - 5);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_count() {
        let limiter = limiter(60_000, 1);
        let now = Instant::now();

        assert!(matches!(
            limiter.check("k", now),
            LimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("k", now + Duration::from_millis(1)),
            LimitDecision::Limited { .. }
        ));
        // Past the window the key starts fresh.
        assert!(matches!(
            limiter.check("k", now + Duration::from_secs(61)),
            LimitDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter(60_000, 1);
        let now = Instant::now();

        assert!(matches!(
            limiter.check("1.2.3.4", now),
            LimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("5.6.7.8", now),
            LimitDecision::Allowed { .. }
        ));
        assert_eq!(limiter.live_keys(), 2);
    }

    #[tokio::test]
    async fn zero_max_disables_the_limiter() {
        let limiter = limiter(60_000, 0);
        assert!(!limiter.enabled());
    }

    #[tokio::test]
    async fn concurrency_guard_counts_in_flight() {
        let guard = ConcurrencyGuard::new(2);
        assert_eq!(guard.in_flight(), 0);

        let first = guard.permits.clone().try_acquire_owned().unwrap();
        let _second = guard.permits.clone().try_acquire_owned().unwrap();
        assert_eq!(guard.in_flight(), 2);
        assert!(guard.permits.clone().try_acquire_owned().is_err());

        // Dropping a permit releases its slot and corrects the count, even
        // when the holder never ran to completion.
        drop(first);
        assert_eq!(guard.in_flight(), 1);
        assert!(guard.permits.clone().try_acquire_owned().is_ok());
    }
}
