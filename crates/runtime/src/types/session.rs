//! Chat session and training-trace records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Certificate, CheckFailure, OwnerId, SessionId, TraceId, VerdictDelta};

/// Role of a chat message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One message inside a chat session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub ts: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            ts: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            ts: Utc::now(),
        }
    }
}

/// A persisted chat session.
///
/// Messages are append-only and `content_hash` always covers the current
/// message list; `updated_at >= created_at` holds for the session's whole
/// lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub owner_id: OwnerId,
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_hash: String,
}

impl Session {
    pub fn new(owner_id: OwnerId, session_id: SessionId) -> Self {
        let now = Utc::now();
        let mut session = Self {
            owner_id,
            session_id,
            context_id: None,
            persona_id: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            content_hash: String::new(),
        };
        session.content_hash = session.compute_hash();
        session
    }

    /// Append a message, bumping `updated_at` and re-hashing the sequence.
    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.updated_at = Utc::now().max(self.updated_at);
        self.content_hash = self.compute_hash();
    }

    /// SHA-256 over the ordered `(role, content)` pairs of the message list.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for message in &self.messages {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            };
            hasher.update(role.as_bytes());
            hasher.update([0u8]);
            hasher.update(message.content.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Listing row for a session, optionally including messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
}

/// One append-only training-trace record emitted by the safety gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingTrace {
    /// Store-assigned position, strictly increasing.
    pub seq: u64,
    pub trace_id: TraceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub pass: bool,
    pub deltas: Vec<VerdictDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_fail: Option<CheckFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rehashes_and_bumps_updated_at() {
        let mut session = Session::new(OwnerId("alice".into()), SessionId::new());
        let empty_hash = session.content_hash.clone();

        session.append(ChatMessage::user("how does the warp bubble solver work?"));
        assert_ne!(session.content_hash, empty_hash);
        assert!(session.updated_at >= session.created_at);
        assert_eq!(session.content_hash, session.compute_hash());
    }

    #[test]
    fn hash_depends_on_message_order() {
        let mut a = Session::new(OwnerId("o".into()), SessionId("s".into()));
        a.append(ChatMessage::user("first"));
        a.append(ChatMessage::assistant("second"));

        let mut b = Session::new(OwnerId("o".into()), SessionId("s".into()));
        b.append(ChatMessage::user("second"));
        b.append(ChatMessage::assistant("first"));

        assert_ne!(a.content_hash, b.content_hash);
    }
}
