//! Structured reply envelopes
//!
//! Replies may carry a set of typed sections next to the plain text. The
//! section kinds are a closed set; anything else the producer attaches
//! rides along in the metadata map as opaque pass-through.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of an envelope section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Answer,
    Details,
    Proof,
    Extension,
}

/// One envelope section: a kind, its text, and untyped extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSection {
    pub kind: SectionKind,
    pub text: String,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl EnvelopeSection {
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Answer,
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn details(text: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Details,
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Structured reply envelope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub sections: Vec<EnvelopeSection>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ReplyEnvelope {
    /// The answer section's text, if one is present.
    pub fn answer_text(&self) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.kind == SectionKind::Answer)
            .map(|s| s.text.as_str())
    }
}
