//! HTTP API data structures
//!
//! Request and response bodies for the gateway's routes. Everything on
//! the wire is camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::toollog::BusStats;
use crate::types::{
    KnowledgeFile, KnowledgeProjectExport, ReplyEnvelope, ResonanceBundle, ResonanceCollapse,
    TraceId,
};

/// Body of `POST /api/agi/ask`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskBody {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub use_knowledge: Option<bool>,
    #[serde(default)]
    pub use_search_fallback: Option<bool>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub resonance: Option<ResonanceBundle>,
    #[serde(default)]
    pub resonance_selection: Option<ResonanceCollapse>,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeFile>,
    /// Whole project exports; their files merge into `knowledge`.
    #[serde(default)]
    pub knowledge_projects: Vec<KnowledgeProjectExport>,
}

impl AskBody {
    /// Flatten inline files and project exports into one candidate list.
    pub fn all_knowledge(&self) -> Vec<KnowledgeFile> {
        let mut files = self.knowledge.clone();
        for project in &self.knowledge_projects {
            for file in &project.files {
                if !files.iter().any(|existing| existing.path == file.path) {
                    files.push(file.clone());
                }
            }
        }
        files
    }
}

/// Response of `POST /api/agi/ask`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<ReplyEnvelope>,
    pub sources: Vec<String>,
    pub trace_id: TraceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub streamed_fallback: bool,
}

/// Body of `POST /api/agi/ask/stop`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBody {
    pub trace_id: String,
}

/// Response of `POST /api/agi/ask/stop`
#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

/// Error envelope for every failing route
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Stable machine-readable reason.
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: None,
            retry_after_ms: None,
            expected_hash: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub bus: BusStats,
    pub queued_asks: usize,
}

/// Query for `GET /api/chat/sessions`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub include_messages: bool,
}

fn default_limit() -> usize {
    50
}

/// Body of `POST /api/chat/sessions`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub persona_id: Option<String>,
}

/// Query for `GET /api/tool-logs/stream`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Query for `GET /api/tool-logs/since`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinceQuery {
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default = "default_since_max")]
    pub max: usize,
}

fn default_since_max() -> usize {
    256
}

/// Query for `GET /api/tool-logs/mock-stream`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockStreamQuery {
    #[serde(default)]
    pub rate_ms: Option<u64>,
}

/// Query for `GET /api/training-trace/export`
#[derive(Debug, Clone, Deserialize)]
pub struct TraceExportQuery {
    #[serde(default)]
    pub since: u64,
    #[serde(default = "default_trace_limit")]
    pub limit: usize,
}

fn default_trace_limit() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_body_accepts_minimal_json() {
        let body: AskBody = serde_json::from_str(r#"{"question":"why warp?"}"#).unwrap();
        assert_eq!(body.question, "why warp?");
        assert!(body.session_id.is_none());
        assert!(!body.debug);
        assert!(body.knowledge.is_empty());
    }

    #[test]
    fn error_response_omits_empty_fields() {
        let json = serde_json::to_value(ErrorResponse::new("rate_limited")).unwrap();
        assert_eq!(json["error"], "rate_limited");
        assert!(json.get("retryAfterMs").is_none());
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn streamed_fallback_is_omitted_when_false() {
        let response = AskResponse {
            text: "t".into(),
            envelope: None,
            sources: vec![],
            trace_id: TraceId("ask:1".into()),
            debug: None,
            streamed_fallback: false,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("streamedFallback").is_none());
    }
}
