//! Environment-driven runtime configuration
//!
//! Every tunable has a default matching production behavior; values are
//! read once at startup and the resulting tables are never mutated.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AskMode, ConfigError};

/// Deployment environment, used by policy decisions such as the mock
/// stream gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

/// HTTP server and feature-gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the HTTP server (default: "127.0.0.1")
    pub bind_address: String,
    /// Port number to listen on
    pub port: u16,
    /// CORS origin allow-list (empty disables CORS)
    pub cors_origins: Vec<String>,
    /// Gate for the ask + adapter routes
    pub enable_agi: bool,
    /// Gate for the training-trace export route
    pub enable_trace_api: bool,
    /// Require a bearer token on AGI routes
    pub enable_agi_auth: bool,
    /// Gate for the essence routes (reserved; kept for parity with deploys)
    pub enable_essence: bool,
    /// Allow the synthesized mock tool-log stream regardless of environment
    pub allow_mock_stream: bool,
    pub environment: Environment,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
            enable_agi: true,
            enable_trace_api: false,
            enable_agi_auth: false,
            enable_essence: false,
            allow_mock_stream: false,
            environment: Environment::Production,
        }
    }
}

/// Sliding-window rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Window length in milliseconds; values under 1000 are clamped up.
    pub window_ms: u64,
    /// Requests per window for general API routes. Zero disables the limiter.
    pub api_max: u32,
    /// Requests per window for ask-job polling routes.
    pub ask_jobs_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            api_max: 240,
            ask_jobs_max: 1_200,
        }
    }
}

impl RateLimitConfig {
    /// Window with the sub-second clamp applied.
    pub fn effective_window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(1_000))
    }
}

/// Ask pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskConfig {
    /// In-flight asks admitted by the route-level concurrency guard.
    pub concurrency_max: usize,
    /// Model context window in tokens.
    pub context_tokens: usize,
    /// Tokens reserved for the model's output.
    pub output_tokens: usize,
    /// Knowledge files considered for the prompt, clamped to [2, 48].
    pub context_files: usize,
    /// Patch files rendered into the resonance section, clamped to [2, 24].
    pub patch_files: usize,
    /// Preview clip length in characters, clamped to [120, 2400].
    pub context_chars: usize,
    /// Run lattice searches when the planner supplies no knowledge.
    pub search_fallback: bool,
    /// Upper bound on derived search queries per ask.
    pub search_query_limit: usize,
    /// Pending asks accepted while a run is active.
    pub queue_limit: usize,
    /// Default processing mode.
    pub mode: AskMode,
    /// Per-stage timeouts.
    pub plan_timeout: Duration,
    pub execute_timeout: Duration,
    pub context_timeout: Duration,
    pub generate_timeout: Duration,
}

impl Default for AskConfig {
    fn default() -> Self {
        let context_tokens = 2_048;
        Self {
            concurrency_max: 4,
            context_tokens,
            output_tokens: 2_048.min(context_tokens / 2),
            context_files: 48,
            patch_files: 12,
            context_chars: 2_400,
            search_fallback: true,
            search_query_limit: 10,
            queue_limit: 12,
            mode: AskMode::Grounded,
            plan_timeout: Duration::from_secs(60),
            execute_timeout: Duration::from_secs(120),
            context_timeout: Duration::from_secs(2),
            generate_timeout: Duration::from_secs(120),
        }
    }
}

/// Tool-log bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Ring buffer capacity.
    pub capacity: usize,
    /// Per-subscriber outbox bound.
    pub outbox_capacity: usize,
    /// SSE heartbeat interval.
    pub ping_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 4_096,
            outbox_capacity: 256,
            ping_interval: Duration::from_secs(15),
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub api: ApiConfig,
    pub rate_limit: RateLimitConfig,
    pub ask: AskConfig,
    pub bus: BusConfig,
}

impl GatewayConfig {
    /// Build the configuration from process environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_string("HELIX_BIND_ADDRESS") {
            config.api.bind_address = value;
        }
        if let Some(value) = env_parse::<u16>("HELIX_PORT")? {
            config.api.port = value;
        }
        if let Some(value) = env_string("HELIX_CORS_ORIGINS") {
            config.api.cors_origins = value
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }
        if let Some(value) = env_bool("ENABLE_AGI")? {
            config.api.enable_agi = value;
        }
        if let Some(value) = env_bool("ENABLE_TRACE_API")? {
            config.api.enable_trace_api = value;
        }
        if let Some(value) = env_bool("ENABLE_AGI_AUTH")? {
            config.api.enable_agi_auth = value;
        }
        if let Some(value) = env_bool("ENABLE_ESSENCE")? {
            config.api.enable_essence = value;
        }
        if let Some(value) = env_bool("QI_SNAP_ALLOW_MOCK")? {
            config.api.allow_mock_stream = value;
        }
        if let Some(value) = env_string("HELIX_ENV") {
            config.api.environment = match value.as_str() {
                "development" | "dev" => Environment::Development,
                _ => Environment::Production,
            };
        }

        if let Some(value) = env_bool("RATE_LIMIT_ENABLED")? {
            config.rate_limit.enabled = value;
        }
        if let Some(value) = env_parse::<u64>("RATE_LIMIT_API_WINDOW_MS")? {
            config.rate_limit.window_ms = value;
        }
        if let Some(value) = env_parse::<u32>("RATE_LIMIT_API_MAX")? {
            config.rate_limit.api_max = value;
        }
        if let Some(value) = env_parse::<u32>("RATE_LIMIT_ASK_JOBS_MAX")? {
            config.rate_limit.ask_jobs_max = value;
        }

        if let Some(value) = env_parse::<usize>("HELIX_ASK_CONCURRENCY_MAX")? {
            config.ask.concurrency_max = value;
        }
        if let Some(value) = env_parse::<usize>("HELIX_ASK_CONTEXT_TOKENS")? {
            config.ask.context_tokens = value;
            config.ask.output_tokens = 2_048.min(value / 2);
        }
        if let Some(value) = env_parse::<usize>("HELIX_ASK_OUTPUT_TOKENS")? {
            config.ask.output_tokens = value;
        }
        if let Some(value) = env_parse::<usize>("HELIX_ASK_CONTEXT_FILES")? {
            config.ask.context_files = value;
        }
        if let Some(value) = env_parse::<usize>("HELIX_ASK_PATCH_FILES")? {
            config.ask.patch_files = value;
        }
        if let Some(value) = env_parse::<usize>("HELIX_ASK_CONTEXT_CHARS")? {
            config.ask.context_chars = value;
        }
        if let Some(value) = env_bool("HELIX_ASK_SEARCH_FALLBACK")? {
            config.ask.search_fallback = value;
        }
        if let Some(value) = env_parse::<usize>("HELIX_ASK_SEARCH_QUERY_LIMIT")? {
            config.ask.search_query_limit = value;
        }
        if let Some(value) = env_parse::<usize>("HELIX_ASK_QUEUE_LIMIT")? {
            config.ask.queue_limit = value;
        }
        if let Some(value) = env_string("HELIX_ASK_MODE") {
            config.ask.mode = value
                .parse()
                .map_err(|reason| ConfigError::ParseError {
                    name: "HELIX_ASK_MODE".to_string(),
                    reason,
                })?;
        }

        if let Some(value) = env_parse::<usize>("HELIX_BUS_CAPACITY")? {
            config.bus.capacity = value;
        }
        if let Some(value) = env_parse::<usize>("HELIX_BUS_OUTBOX")? {
            config.bus.outbox_capacity = value;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.capacity == 0 {
            return Err(ConfigError::Invalid(
                "bus capacity must be at least 1".to_string(),
            ));
        }
        if self.bus.outbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "bus outbox capacity must be at least 1".to_string(),
            ));
        }
        if self.ask.concurrency_max == 0 {
            return Err(ConfigError::Invalid(
                "ask concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                name: name.to_string(),
                reason: e.to_string(),
            }),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "enabled" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "disabled" => Ok(Some(false)),
            other => Err(ConfigError::ParseError {
                name: name.to_string(),
                reason: format!("expected a boolean, got {other:?}"),
            }),
        },
    }
}
