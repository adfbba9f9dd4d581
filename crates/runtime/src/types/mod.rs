//! Core types and data structures for the Helix gateway runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod envelope;
pub mod error;
pub mod session;

pub use envelope::*;
pub use error::*;
pub use session::*;

/// Unique identifier for a single Ask run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a tool-log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trace identifier linking one Ask's lifecycle across the bus, the
/// orchestrator, and the training-trace store. Ask-originated traces carry
/// the `ask:` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    /// Allocate a fresh Ask trace id.
    pub fn for_ask() -> Self {
        Self(format!("ask:{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TraceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner identity for chat sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An identity is usable only when non-empty after trimming.
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chat session identifier, unique within an owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ask processing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AskMode {
    /// Ground the answer in retrieved context and generate text.
    #[default]
    Grounded,
    /// Plan and run the tool-chain, then summarize the execution.
    Execute,
}

impl std::fmt::Display for AskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AskMode::Grounded => write!(f, "grounded"),
            AskMode::Execute => write!(f, "execute"),
        }
    }
}

impl std::str::FromStr for AskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grounded" => Ok(AskMode::Grounded),
            "execute" => Ok(AskMode::Execute),
            other => Err(format!("unknown ask mode: {other}")),
        }
    }
}

/// Stage of a tool invocation reflected on the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolStage {
    #[default]
    Start,
    Chunk,
    End,
}

/// One immutable record on the tool-log bus.
///
/// `seq` is assigned by the bus and is strictly monotonic across the
/// process; `id` is unique per event. Events never change once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLogEvent {
    pub id: EventId,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    pub tool: String,
    pub stage: ToolStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A file reference carried inside a resonance patch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchFile {
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub preview: String,
}

/// Knowledge files attached to a resonance patch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchKnowledge {
    #[serde(default)]
    pub files: Vec<PatchFile>,
}

/// A pre-computed retrieval candidate: summary plus associated files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResonancePatch {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub knowledge: PatchKnowledge,
}

/// The candidate set produced by a code-lattice query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResonanceBundle {
    #[serde(default)]
    pub candidates: Vec<ResonancePatch>,
}

/// Optional collapse pinning one candidate as primary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResonanceCollapse {
    #[serde(default)]
    pub primary_patch_id: Option<String>,
}

/// A file inside a knowledge project export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeFile {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub size: u64,
}

/// Export wrapper around a knowledge project's files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeProjectExport {
    pub project: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files: Vec<KnowledgeFile>,
    #[serde(default)]
    pub approx_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omitted_files: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<serde_json::Value>,
}

/// One section of an assembled prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSection {
    pub title: String,
    pub body: String,
}

/// Result of context assembly: ordered sections, stable citation labels,
/// and the unused remainder of the token budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPlan {
    pub sections: Vec<PromptSection>,
    pub sources: Vec<String>,
    pub remaining_tokens: usize,
}

impl PromptPlan {
    /// Render the full prompt text in section order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&section.title);
            if !section.body.is_empty() {
                out.push('\n');
                out.push_str(&section.body);
            }
        }
        out
    }
}

/// Severity of a safety or constraint check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Hard,
    Soft,
}

/// Details of the first check that failed during a gate evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckFailure {
    pub id: String,
    pub severity: Severity,
    pub status: String,
    pub value: f64,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Kind of change a delta records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaChange {
    Added,
    Modified,
    Removed,
}

/// Audit record for one evaluated check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictDelta {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<f64>,
    pub to: f64,
    pub delta: f64,
    pub change: DeltaChange,
}

/// Certificate status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CertificateStatus {
    Green,
    Red,
}

/// Deterministic attestation over a checked payload.
///
/// The hash is SHA-256 of the canonical JSON of the evaluated checks, so
/// any change in inputs changes the certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub status: CertificateStatus,
    pub certificate_hash: String,
    pub certificate_id: String,
    pub integrity_ok: bool,
}

/// Outcome of a safety-gate evaluation, handed to the caller by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_fail: Option<CheckFailure>,
    pub deltas: Vec<VerdictDelta>,
    pub certificate: Certificate,
}
