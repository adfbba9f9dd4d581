//! Error types for the Helix gateway runtime

use thiserror::Error;

use super::SessionId;

/// Main gateway error type
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ask error: {0}")]
    Ask(#[from] AskError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Safety error: {0}")]
    Safety(#[from] SafetyError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse {name}: {reason}")]
    ParseError { name: String, reason: String },
}

/// Errors produced while driving one Ask request
#[derive(Error, Debug, Clone)]
pub enum AskError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Planner failed: {0}")]
    PlanFailed(String),

    #[error("Executor failed: {0}")]
    ExecuteFailed(String),

    #[error("Prompt exceeded the context window: {0}")]
    ContextOverflow(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Ask queue is full ({limit} pending)")]
    QueueFull { limit: usize },

    #[error("Run was aborted")]
    Aborted,
}

impl AskError {
    /// Stable machine-readable reason string for the wire.
    pub fn reason(&self) -> &'static str {
        match self {
            AskError::InvalidRequest(_) => "invalid_request",
            AskError::PlanFailed(_) => "plan_failed",
            AskError::ExecuteFailed(_) => "execute_failed",
            AskError::ContextOverflow(_) => "context_overflow",
            AskError::GenerationFailed(_) => "generation_failed",
            AskError::QueueFull { .. } => "concurrency_exhausted",
            AskError::Aborted => "aborted",
        }
    }
}

/// Session and trace store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Operation requires a valid owner identity")]
    Forbidden,

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("Session content hash mismatch, expected {expected}")]
    HashMismatch { expected: String },
}

impl StoreError {
    pub fn reason(&self) -> &'static str {
        match self {
            StoreError::Forbidden => "forbidden",
            StoreError::SessionNotFound { .. } => "not_found",
            StoreError::HashMismatch { .. } => "hash_mismatch",
        }
    }
}

/// Safety gate errors
#[derive(Error, Debug, Clone)]
pub enum SafetyError {
    #[error("Action {action_id} crosses the controller boundary: {reason}")]
    ControllerBoundaryViolation { action_id: String, reason: String },

    #[error("Unknown constraint pack: {id}")]
    UnknownPack { id: String },

    #[error("Invalid constraint pack: {0}")]
    InvalidPack(String),

    #[error("Telemetry value missing for check {key}")]
    TelemetryMissing { key: String },
}

impl SafetyError {
    pub fn reason(&self) -> &'static str {
        match self {
            SafetyError::ControllerBoundaryViolation { .. } => "controller-boundary-violation",
            SafetyError::UnknownPack { .. } => "invalid_request",
            SafetyError::InvalidPack(_) => "invalid_request",
            SafetyError::TelemetryMissing { .. } => "invalid_request",
        }
    }
}

/// Errors surfaced by external capabilities (planner, executor, search,
/// language model). The orchestrator maps these onto [`AskError`].
#[derive(Error, Debug, Clone)]
pub enum CapabilityError {
    #[error("Capability rejected the request: {0}")]
    BadRequest(String),

    #[error("Knowledge projects are disabled for this tenant")]
    KnowledgeProjectsDisabled,

    #[error("Capability call failed: {0}")]
    Failed(String),

    #[error("Capability call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Capability call was aborted")]
    Aborted,
}

impl CapabilityError {
    /// Failures whose message points at context exhaustion are retried once
    /// with a reduced prompt budget.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            CapabilityError::Failed(msg) | CapabilityError::BadRequest(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("context") || lower.contains("token") || lower.contains("exceed")
            }
            _ => false,
        }
    }

    /// Plan failures that warrant one retry without knowledge context.
    pub fn is_knowledge_rejection(&self) -> bool {
        matches!(
            self,
            CapabilityError::KnowledgeProjectsDisabled | CapabilityError::BadRequest(_)
        )
    }
}
